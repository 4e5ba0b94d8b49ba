//! Mutation envelopes and their mapping to and from log entries.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use snapsync_core::{CollectionId, Fields, LogEntry, Mutation, ObjectStore, Record, RecordId, Version};

/// The unit of replication: one record state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Record id.
    pub id: RecordId,
    /// Version the change produces.
    pub version: Version,
    /// Changed fields. Empty for deletes and membership-only changes.
    pub fields: Fields,
    /// Tombstone flag.
    pub deleted: bool,
    /// Collection the record joins, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionId>,
}

impl Envelope {
    /// Creates an envelope carrying a whole record.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version,
            fields: record.fields.clone(),
            deleted: record.deleted,
            collection: None,
        }
    }

    /// Rejects envelopes that cannot name a record state.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for an empty id, version 0 or
    /// an empty collection name.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.is_empty() {
            return Err(ProtocolError::malformed("empty record id"));
        }
        if self.version.as_u64() == 0 {
            return Err(ProtocolError::malformed(format!(
                "record {} has version 0",
                self.id
            )));
        }
        if self.collection.as_ref().is_some_and(|c| c.as_str().is_empty()) {
            return Err(ProtocolError::malformed(format!(
                "record {} names an empty collection",
                self.id
            )));
        }
        Ok(())
    }

    /// Converts an inbound envelope into the mutation to log.
    ///
    /// A tombstone becomes `Delete`. An id the store has never seen becomes
    /// `Create` at the envelope's version; a known id becomes `Update` with
    /// `base_version = version - 1`. A collection adds an
    /// `AppendToCollection` in the same batch.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the envelope fails
    /// [`Envelope::validate`].
    pub fn into_mutation(self, store: &ObjectStore) -> ProtocolResult<Mutation> {
        self.validate()?;
        let Self {
            id,
            version,
            fields,
            deleted,
            collection,
        } = self;

        let mut parts = Vec::with_capacity(2);
        let known = store.get(&id).is_some();
        if deleted {
            parts.push(Mutation::Delete { id: id.clone() });
        } else if !known {
            parts.push(Mutation::Create(Record {
                id: id.clone(),
                version,
                fields,
                deleted: false,
            }));
        } else if !(fields.is_empty() && collection.is_some()) {
            parts.push(Mutation::Update {
                id: id.clone(),
                fields,
                base_version: Version::new(version.as_u64() - 1),
            });
        }
        if let Some(collection) = collection {
            parts.push(Mutation::AppendToCollection { collection, id });
        }

        Ok(match parts.len() {
            1 => parts.remove(0),
            _ => Mutation::Batch(parts),
        })
    }
}

/// Builds the outbound envelopes for one log entry.
///
/// A batch yields one envelope per record it touches: a `Create` followed
/// by an `AppendToCollection` of the same id collapses into a single
/// envelope with `collection` set. Deletes carry the tombstone version the
/// store assigned. Parts naming records the store does not hold are
/// skipped, since they had no effect locally.
#[must_use]
pub fn envelopes_for_entry(entry: &LogEntry, store: &ObjectStore) -> Vec<Envelope> {
    let mut out: Vec<Envelope> = Vec::new();
    for part in entry.mutation.parts() {
        match part {
            Mutation::Create(record) => out.push(Envelope::from_record(record)),
            Mutation::Update {
                id,
                fields,
                base_version,
            } => out.push(Envelope {
                id: id.clone(),
                version: base_version.next(),
                fields: fields.clone(),
                deleted: false,
                collection: None,
            }),
            Mutation::Delete { id } => {
                let Some(current) = store.get(id) else {
                    continue;
                };
                let version = if current.deleted {
                    current.version
                } else {
                    current.version.next()
                };
                out.push(Envelope {
                    id: id.clone(),
                    version,
                    fields: Fields::new(),
                    deleted: true,
                    collection: None,
                });
            }
            Mutation::AppendToCollection { collection, id } => {
                if let Some(pending) = out
                    .iter_mut()
                    .find(|e| &e.id == id && !e.deleted && e.collection.is_none())
                {
                    pending.collection = Some(collection.clone());
                    continue;
                }
                let Some(current) = store.get(id) else {
                    continue;
                };
                out.push(Envelope {
                    id: id.clone(),
                    version: current.version,
                    fields: Fields::new(),
                    deleted: false,
                    collection: Some(collection.clone()),
                });
            }
            Mutation::Batch(_) => {}
        }
    }
    out
}
