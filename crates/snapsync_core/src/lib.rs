//! # Snapsync Core
//!
//! The local half of a local-first object sync system.
//!
//! This crate provides:
//! - A durable, checksummed log of mutations with crash recovery
//! - An object store materialized from that log, with version-based
//!   conflict resolution
//! - A change notifier with ordered, weakly-held subscriptions
//! - Collection handles and write transactions
//! - The [`Database`] facade the UI and the sync session talk to
//!
//! ## Write Path
//!
//! ```text
//! submit / ingest_remote
//!     -> DurableLog::append      (sequence number assigned, frame durable)
//!     -> ObjectStore::apply      (new Arc<Record> values swapped in)
//!     -> ChangeNotifier          (subscribers called in log order)
//! ```
//!
//! ## Key Invariants
//!
//! - The log's sequence number is the only ordering; store and notifier
//!   observe exactly that order
//! - Applying an already-applied sequence number changes nothing
//! - A record's version never decreases
//! - Conflicts resolve by version, and remote writes win ties
//! - Compaction only drops entries the remote authority acknowledged

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod database;
mod dir;
mod error;
mod log;
mod mutation;
mod notifier;
mod record;
mod snapshot;
mod store;
mod types;

pub use collection::{CollectionHandle, Transaction};
pub use config::Config;
pub use database::{Database, DatabaseStats};
pub use dir::DatabaseDir;
pub use error::{CoreError, CoreResult};
pub use log::{
    compute_crc32, scan_log, DurableLog, LogHeader, LogReplay, LogScan, FRAME_OVERHEAD, LOG_MAGIC,
    LOG_VERSION,
};
pub use mutation::{LogEntry, Mutation};
pub use notifier::{ChangeEvent, ChangeNotifier, Subscription};
pub use record::{fields, FieldValue, Fields, Record};
pub use snapshot::{SnapshotRecord, StoreSnapshot};
pub use store::{Applied, ApplyOutcome, ChangeKind, Conflict, ObjectStore, RecordChange};
pub use types::{CollectionId, Origin, RecordId, SequenceNumber, Version};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
