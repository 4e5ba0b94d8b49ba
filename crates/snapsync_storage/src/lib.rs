//! # Snapsync Storage
//!
//! Byte-store backends underneath the Snapsync durable log, log header and
//! store snapshot.
//!
//! Backends never interpret what they hold. The log frame format, header
//! layout and snapshot encoding all live in `snapsync_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and throwaway databases
//! - [`FileBackend`] - a single file on the local file system
//!
//! ## Example
//!
//! ```rust
//! use snapsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//!
//! backend.replace(b"header").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"header");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
