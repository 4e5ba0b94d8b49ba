//! Durable log: the append-only source of truth for recovery and resend.
//!
//! Every mutation, local or remote, is appended here before the object
//! store sees it. Replaying the log from the start into an empty store
//! rebuilds the exact in-memory state.
//!
//! ## Entry Frame
//!
//! ```text
//! | magic (4) | version (2) | origin (1) | sequence (8) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! All integers are little endian. `payload` is the CBOR encoding of a
//! [`crate::Mutation`], `length` is its size, and the CRC32 covers every
//! byte before it.
//!
//! ## Header
//!
//! A separate small file records the last compacted sequence number, the
//! acknowledged watermark and the remote cursor. It is rewritten as a whole
//! through [`snapsync_storage::StorageBackend::replace`].
//!
//! ## Recovery Policy
//!
//! Tolerated (treated as the clean end of the log and cut off on open):
//!
//! - fewer bytes than a frame header at the tail
//! - a frame whose declared payload runs past the end of the file
//!
//! Fatal (open fails):
//!
//! - CRC mismatch
//! - bad magic or unknown format version
//! - an unknown origin byte
//! - sequence numbers that do not strictly increase
//!
//! ## Invariants
//!
//! - Appends are all-or-nothing; a failed append leaves no partial frame
//! - Sequence numbers are assigned in append order and never reused
//! - The acknowledged watermark only moves forward
//! - Compaction never drops an entry above the watermark

mod frame;
mod header;
mod replay;
mod scan;
mod writer;

pub use frame::{compute_crc32, FRAME_OVERHEAD, LOG_MAGIC, LOG_VERSION};
pub use header::LogHeader;
pub use replay::LogReplay;
pub use scan::{scan_log, LogScan};
pub use writer::DurableLog;
