//! Session states and the status reported to consumers.

use crate::error::SessionError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// State of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not connected; either not started yet or waiting to retry.
    Disconnected,
    /// Connected at the transport level, handshake in flight.
    Authenticating,
    /// Handshake done, streaming in both directions.
    Connected,
    /// Applying an inbound remote mutation.
    Reconciling,
    /// The authority refused the credentials. Not retried.
    SignedOut,
    /// Gave up: retry budget exhausted or a fatal local error.
    Failed,
    /// Cancelled by the owner.
    Stopped,
}

impl SessionState {
    /// Returns true once the session task has ended in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SignedOut | Self::Failed | Self::Stopped)
    }

    /// Returns true while the handshake has completed.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Reconciling)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconciling => "reconciling",
            Self::SignedOut => "signed-out",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a consumer sees of the session: its state and, if something just
/// went wrong, the error.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// The error that caused this status, if any.
    pub error: Option<Arc<SessionError>>,
}

impl SessionStatus {
    /// A status without error.
    pub fn new(state: SessionState) -> Self {
        Self { state, error: None }
    }

    /// A status caused by `error`.
    pub fn with_error(state: SessionState, error: SessionError) -> Self {
        Self {
            state,
            error: Some(Arc::new(error)),
        }
    }

    /// The message a UI should show, if any. Sync churn stays invisible;
    /// only a refused sign-in asks the user to act.
    pub fn user_message(&self) -> Option<&'static str> {
        match self.state {
            SessionState::SignedOut => Some("signed out, please re-authenticate"),
            _ => None,
        }
    }
}

type StatusCallback = Arc<dyn Fn(&SessionStatus) + Send + Sync>;

/// Registered status callbacks.
#[derive(Default)]
pub(crate) struct StatusCallbacks {
    callbacks: RwLock<Vec<StatusCallback>>,
}

impl StatusCallbacks {
    pub(crate) fn register(&self, callback: StatusCallback) {
        self.callbacks.write().push(callback);
    }

    pub(crate) fn notify(&self, status: &SessionStatus) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(status);
        }
    }
}
