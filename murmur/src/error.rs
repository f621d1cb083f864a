//! Client error taxonomy.

use murmur_proto::codec::CodecError;
use murmur_proto::event::ErrorCode;

/// Failure of a client operation.
///
/// [`ClientError::is_retryable`] separates failures worth offering a retry
/// for (transport loss, timeouts, `TransientFailure`) from terminal ones.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server answered the request with an `error` frame.
    #[error("{code}: {message}")]
    Server {
        /// Machine-readable reason.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },

    /// No live connection; the request was not sent.
    #[error("not connected")]
    Disconnected,

    /// No reply arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The WebSocket could not be opened or failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server answered with an event that does not fit the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    /// The operation needs an open conversation.
    #[error("no conversation is open")]
    NoConversation,
}

impl ClientError {
    /// Whether repeating the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Server { code, .. } => code.is_retryable(),
            Self::Disconnected | Self::Timeout | Self::Transport(_) => true,
            Self::Codec(_) | Self::UnexpectedReply(_) | Self::NoConversation => false,
        }
    }

    /// The server error code, if the server rejected the request.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}
