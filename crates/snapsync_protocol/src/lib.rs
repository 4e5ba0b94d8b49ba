//! # Snapsync Protocol
//!
//! Wire messages exchanged between a device and the remote authority.
//!
//! This crate provides:
//! - The handshake (`Hello` with credentials and resume cursors, answered
//!   by `Welcome` or `Rejected`)
//! - Mutation envelopes `{id, version, fields, deleted}` in both directions
//! - `Ack { up_to }` control messages
//! - Conversion between log entries and envelopes
//!
//! Every message is one CBOR frame. This is a pure protocol crate with no
//! I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod messages;

pub use envelope::{envelopes_for_entry, Envelope};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ClientMessage, Credentials, Hello, ServerMessage, PROTOCOL_VERSION};
