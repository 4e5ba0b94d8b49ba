//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding, decoding or interpreting messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("encode error: {message}")]
    Encode {
        /// Description.
        message: String,
    },

    /// A frame was not a valid message.
    #[error("decode error: {message}")]
    Decode {
        /// Description.
        message: String,
    },

    /// A well-formed frame carried data that cannot become a mutation.
    #[error("malformed envelope: {message}")]
    Malformed {
        /// Description.
        message: String,
    },

    /// The peer speaks a different protocol version.
    #[error("unsupported protocol version {actual} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build speaks.
        expected: u16,
        /// Version the peer sent.
        actual: u16,
    },
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a malformed-envelope error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Returns `true` if the error concerns the content of a frame rather
    /// than the framing itself.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::Decode { .. })
    }
}
