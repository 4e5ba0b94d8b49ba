//! Error types for the sync session.

use snapsync_core::CoreError;
use snapsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors a sync session can run into.
///
/// Only [`SessionStatus`](crate::SessionStatus) carries these to the
/// consumer; nothing here terminates the process.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connection failed or was lost.
    #[error("transport error: {message}")]
    Transport {
        /// Description.
        message: String,
    },

    /// The authority refused the credentials.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Reason given by the authority.
        reason: String,
    },

    /// Remote data could not become a mutation. The session keeps going.
    #[error("malformed remote mutation: {message}")]
    MalformedMutation {
        /// Description.
        message: String,
    },

    /// The authority broke the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local log or store failure.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// The inbound stream skipped mutations. The session reconnects and
    /// resumes from its remote cursor.
    #[error("gap in remote stream: cursor at {cursor}, next mutation follows {after}")]
    StreamGap {
        /// Persisted remote cursor.
        cursor: u64,
        /// Sequence number the incoming mutation follows.
        after: u64,
    },

    /// The handshake did not complete in time.
    #[error("handshake timed out")]
    Timeout,

    /// The session was cancelled.
    #[error("session cancelled")]
    Cancelled,

    /// Too many consecutive transport failures.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        /// Consecutive failures.
        attempts: u32,
        /// The last failure.
        last_error: String,
    },
}

impl SessionError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    /// Creates a malformed-mutation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMutation {
            message: message.into(),
        }
    }

    /// Returns true if reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout | Self::StreamGap { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SessionError::transport("connection reset").is_retryable());
        assert!(SessionError::Timeout.is_retryable());
        assert!(SessionError::StreamGap { cursor: 2, after: 5 }.is_retryable());
        assert!(!SessionError::auth("bad password").is_retryable());
        assert!(!SessionError::malformed("empty id").is_retryable());
        assert!(!SessionError::Cancelled.is_retryable());
        assert!(!SessionError::from(CoreError::DatabaseLocked).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SessionError::RetryBudgetExhausted {
            attempts: 3,
            last_error: "transport error: refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 3 attempts: transport error: refused"
        );
        assert_eq!(
            SessionError::auth("bad password").to_string(),
            "authentication failed: bad password"
        );
    }
}
