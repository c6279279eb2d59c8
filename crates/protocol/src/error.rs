//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way a frame can fail to encode or decode.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a frame (bad JSON or unknown shape).
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A `data` field did not hold valid base64.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A well-formed frame arrived in a direction where it is not allowed.
    #[error("unexpected {kind} frame")]
    UnexpectedFrame {
        /// Wire tag of the offending frame.
        kind: &'static str,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}
