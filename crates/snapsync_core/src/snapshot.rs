//! Store snapshots written by log compaction.

use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::types::{CollectionId, Origin, RecordId, SequenceNumber};
use serde::{Deserialize, Serialize};

const SNAPSHOT_FORMAT: u16 = 1;

/// A record as stored in a snapshot, with the origin of its last write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Record state.
    pub record: Record,
    /// Origin of the write that produced it, needed for tie-breaking.
    pub origin: Origin,
}

/// Complete object store state at a sequence number.
///
/// Compaction folds the dropped log prefix into a snapshot so that opening
/// the database needs only the snapshot plus the retained log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Last sequence number reflected in the snapshot.
    pub applied_through: SequenceNumber,
    /// All records, tombstones included, sorted by id.
    pub records: Vec<SnapshotRecord>,
    /// Collections and their member ids, sorted by collection.
    pub collections: Vec<(CollectionId, Vec<RecordId>)>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u16,
    snapshot: StoreSnapshot,
}

impl StoreSnapshot {
    /// Serializes the snapshot as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(
            &Envelope {
                format: SNAPSHOT_FORMAT,
                snapshot: self.clone(),
            },
            &mut buf,
        )
        .map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Parses a snapshot; an empty buffer means there is none.
    ///
    /// # Errors
    ///
    /// Returns an error for undecodable bytes or an unknown format.
    pub fn decode(bytes: &[u8]) -> CoreResult<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let envelope: Envelope =
            ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        if envelope.format != SNAPSHOT_FORMAT {
            return Err(CoreError::invalid_format(format!(
                "unsupported snapshot format {}",
                envelope.format
            )));
        }
        Ok(Some(envelope.snapshot))
    }
}
