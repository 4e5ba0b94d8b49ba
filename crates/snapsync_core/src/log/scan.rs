//! Read-only walk over a log file.

use super::frame::read_frame;
use crate::error::{CoreError, CoreResult};
use crate::mutation::LogEntry;
use crate::types::{Origin, SequenceNumber};
use serde::Serialize;
use snapsync_storage::StorageBackend;

/// What a walk over a log file found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogScan {
    /// Complete, checksummed frames.
    pub entries: usize,
    /// Entries appended on this device.
    pub local_entries: usize,
    /// Entries received from the remote authority.
    pub remote_entries: usize,
    /// First sequence number in the file.
    pub first: Option<SequenceNumber>,
    /// Last sequence number in the file.
    pub last: Option<SequenceNumber>,
    /// Bytes covered by complete frames.
    pub valid_bytes: u64,
    /// Bytes of an incomplete trailing frame. Opening the log cuts them off.
    pub torn_bytes: u64,
}

/// Walks every frame of `backend` without modifying it.
///
/// # Errors
///
/// Returns an error on a checksum mismatch, a bad frame header or sequence
/// numbers that do not strictly increase.
pub fn scan_log(backend: &dyn StorageBackend) -> CoreResult<LogScan> {
    let mut scan = LogScan::default();
    let (valid_bytes, size) = walk_frames(backend, |entry, _| {
        scan.entries += 1;
        match entry.origin {
            Origin::Local => scan.local_entries += 1,
            Origin::Remote => scan.remote_entries += 1,
        }
        scan.first.get_or_insert(entry.sequence);
        scan.last = Some(entry.sequence);
    })?;
    scan.valid_bytes = valid_bytes;
    scan.torn_bytes = size - valid_bytes;
    Ok(scan)
}

/// Calls `visit` with every complete frame and its offset. Returns the end
/// of the last complete frame and the file size.
pub(crate) fn walk_frames(
    backend: &dyn StorageBackend,
    mut visit: impl FnMut(&LogEntry, u64),
) -> CoreResult<(u64, u64)> {
    let size = backend.size()?;
    let mut offset = 0u64;
    let mut last = SequenceNumber::ZERO;
    while let Some((entry, len)) = read_frame(backend, offset, size)? {
        if entry.sequence <= last {
            return Err(CoreError::log_corruption(
                offset,
                format!("{} follows {}", entry.sequence, last),
            ));
        }
        last = entry.sequence;
        visit(&entry, offset);
        offset += len;
    }
    Ok((offset, size))
}
