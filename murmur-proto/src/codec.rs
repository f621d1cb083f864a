//! JSON encoding for Murmur frames.
//!
//! Every frame travels as a single WebSocket text message. Decoding is
//! strict: unknown event types, missing fields and wrong field types are
//! all rejected with [`CodecError::Malformed`].

use crate::event::{ClientFrame, ServerFrame};

/// Upper bound on a single inbound text frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The input was not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The input exceeded [`MAX_FRAME_BYTES`].
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size.
        size: usize,
        /// Limit.
        max: usize,
    },
}

/// Encodes a client request.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a client request.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` for oversized input or
/// `CodecError::Malformed` if the text is not a valid [`ClientFrame`].
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encodes a server frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a server frame.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the text is not a valid [`ServerFrame`].
pub fn decode_server(text: &str) -> Result<ServerFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Best-effort extraction of the request id from a frame that failed to
/// decode, so the error reply can still be correlated.
#[must_use]
pub fn recover_request_id(text: &str) -> Option<u64> {
    if text.len() > MAX_FRAME_BYTES {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

fn check_size(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(())
}
