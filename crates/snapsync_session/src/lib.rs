//! # Snapsync Session
//!
//! Keeps a [`Database`](snapsync_core::Database) in sync with a remote
//! authority.
//!
//! This crate provides:
//! - The sync session state machine
//!   (`Disconnected -> Authenticating -> Connected <-> Reconciling`)
//! - Upload of unacknowledged local entries and ingestion of remote ones
//! - Reconnection with exponential backoff and jitter
//! - Status reporting through a watch channel and callbacks
//! - A transport abstraction and an in-process loopback authority
//!
//! ## Architecture
//!
//! The session runs as one tokio task. It reaches the database only through
//! the same entry points any writer uses, so remote mutations are logged,
//! applied and notified exactly like local ones:
//!
//! ```text
//! local writer -> Database::append ----+
//!                                      +--> log -> store -> notifier
//! session task -> Database::ingest_remote
//! ```
//!
//! ## Key Invariants
//!
//! - Uploads resume from the acknowledged watermark; acknowledged entries
//!   are never re-sent
//! - The watermark only moves forward, and only on an authority ack
//! - Authentication failures end the session; transport failures retry
//! - Malformed remote data is logged and skipped
//! - Cancellation never discards unacknowledged entries

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod loopback;
mod session;
mod state;
mod transport;

pub use config::{BackoffConfig, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use loopback::{AuthorityEntry, LoopbackAuthority, LoopbackTransport};
pub use session::{SessionHandle, SyncSession};
pub use state::{SessionState, SessionStatus};
pub use transport::{Connection, RemoteTransport};
