//! Engine-level error taxonomy.

use murmur_proto::event::ErrorCode;
use murmur_proto::message::ValidationError;

use crate::store::StoreError;

/// Failure of a chat operation, mapped onto a wire [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The caller may not perform this action.
    #[error("{0}")]
    NotAuthorized(String),

    /// The referenced user, conversation or cursor does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request payload failed validation.
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    /// The store failed; see [`StoreError::is_transient`].
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotAuthorized(_) => ErrorCode::NotAuthorized,
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Store(e) if e.is_transient() => ErrorCode::TransientFailure,
            Self::Store(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to show the caller. Internal failures are reported
    /// generically; their details only go to the log.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::InternalError => "internal error".to_string(),
            ErrorCode::TransientFailure => "temporarily unavailable, retry".to_string(),
            _ => self.to_string(),
        }
    }
}
