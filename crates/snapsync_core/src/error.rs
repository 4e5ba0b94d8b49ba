//! Error types for the sync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the durable log, the object store and the database
/// facade.
///
/// Storage and I/O failures are the only errors a local write can hit once
/// its input is well formed. Version conflicts are not errors: the store
/// resolves them and reports a [`crate::Conflict`] value instead.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] snapsync_storage::StorageError),

    /// I/O error outside a storage backend (directory, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A mutation or snapshot could not be serialized or deserialized.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The durable log holds something that is not a valid frame.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Offset of the bad frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A frame or header failed its CRC check.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A mutation is structurally invalid (empty id, nested batch, ...).
    #[error("malformed mutation: {message}")]
    MalformedMutation {
        /// What is wrong with it.
        message: String,
    },

    /// A header, snapshot or directory is not in the expected format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the database directory lock.
    #[error("database is locked by another process")]
    DatabaseLocked,

    /// The database already exists and `error_if_exists` was set.
    #[error("database already exists: {path}")]
    AlreadyExists {
        /// Directory that was found.
        path: String,
    },

    /// A helper that needs an existing record could not find it.
    #[error("record not found: {id}")]
    RecordNotFound {
        /// The missing id.
        id: String,
    },

    /// The operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates a malformed mutation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMutation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a record-not-found error.
    pub fn record_not_found(id: impl std::fmt::Display) -> Self {
        Self::RecordNotFound { id: id.to_string() }
    }

    /// Returns `true` for failures of the underlying storage, the class of
    /// error a caller may retry.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// The message a UI shows when a local write fails.
    ///
    /// Every core failure collapses to the same retry prompt.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        "add failed, retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_classification() {
        let err = CoreError::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(err.is_io());
        assert!(!CoreError::malformed("nested batch").is_io());
        assert!(!CoreError::DatabaseLocked.is_io());
    }

    #[test]
    fn user_message_is_uniform() {
        assert_eq!(CoreError::DatabaseLocked.user_message(), "add failed, retry");
        assert_eq!(
            CoreError::codec("bad cbor").user_message(),
            "add failed, retry"
        );
    }

    #[test]
    fn display_includes_context() {
        let err = CoreError::log_corruption(42, "bad magic");
        assert_eq!(err.to_string(), "log corruption at offset 42: bad magic");

        let err = CoreError::ChecksumMismatch {
            expected: 0xCBF4_3926,
            actual: 0,
        };
        assert!(err.to_string().contains("0xcbf43926"));
    }
}
