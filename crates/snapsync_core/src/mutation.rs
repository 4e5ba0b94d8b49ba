//! Mutations: the unit of change written to the durable log.

use crate::error::{CoreError, CoreResult};
use crate::record::{Fields, Record};
use crate::types::{CollectionId, Origin, RecordId, SequenceNumber, Version};
use serde::{Deserialize, Serialize};

/// An operation against the durable log.
///
/// `Batch` is the write-transaction form: the whole batch is one log entry,
/// applied atomically and announced with one change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Installs a new record.
    Create(Record),
    /// Overwrites the named fields of a record last seen at `base_version`.
    Update {
        /// Target record.
        id: RecordId,
        /// Fields to overwrite.
        fields: Fields,
        /// Version the writer based the change on.
        base_version: Version,
    },
    /// Tombstones a record.
    Delete {
        /// Target record.
        id: RecordId,
    },
    /// Adds a record reference to the end of a collection.
    AppendToCollection {
        /// Target collection.
        collection: CollectionId,
        /// Referenced record.
        id: RecordId,
    },
    /// Several mutations that become visible together.
    Batch(Vec<Mutation>),
}

impl Mutation {
    /// Checks structural validity: non-empty ids, non-zero versions, no
    /// nested or empty batches.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedMutation`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Batch(items) => {
                if items.is_empty() {
                    return Err(CoreError::malformed("empty batch"));
                }
                for item in items {
                    if matches!(item, Self::Batch(_)) {
                        return Err(CoreError::malformed("nested batch"));
                    }
                    item.validate()?;
                }
                Ok(())
            }
            Self::Create(record) => {
                check_id(&record.id)?;
                if record.version == Version::default() {
                    return Err(CoreError::malformed(format!(
                        "record {} created at version 0",
                        record.id
                    )));
                }
                Ok(())
            }
            Self::Update { id, .. } | Self::Delete { id } => check_id(id),
            Self::AppendToCollection { collection, id } => {
                if collection.as_str().is_empty() {
                    return Err(CoreError::malformed("empty collection id"));
                }
                check_id(id)
            }
        }
    }

    /// Short name of the variant for logs and dumps.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::AppendToCollection { .. } => "append",
            Self::Batch(_) => "batch",
        }
    }

    /// Flattens a batch into its parts; other variants yield themselves.
    pub fn parts(&self) -> impl Iterator<Item = &Mutation> {
        match self {
            Self::Batch(items) => items.iter(),
            other => std::slice::from_ref(other).iter(),
        }
    }

    /// Record ids this mutation touches, in order, without repeats.
    #[must_use]
    pub fn record_ids(&self) -> Vec<&RecordId> {
        let mut ids: Vec<&RecordId> = Vec::new();
        for part in self.parts() {
            let id = match part {
                Self::Create(record) => &record.id,
                Self::Update { id, .. }
                | Self::Delete { id }
                | Self::AppendToCollection { id, .. } => id,
                Self::Batch(_) => continue,
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Serializes the mutation as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Deserializes a CBOR mutation.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a mutation.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

fn check_id(id: &RecordId) -> CoreResult<()> {
    if id.is_empty() {
        Err(CoreError::malformed("empty record id"))
    } else {
        Ok(())
    }
}

/// A mutation as it sits in the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log.
    pub sequence: SequenceNumber,
    /// Who produced the mutation.
    pub origin: Origin,
    /// The mutation itself.
    pub mutation: Mutation,
}

impl LogEntry {
    /// Creates a log entry.
    #[must_use]
    pub fn new(sequence: SequenceNumber, origin: Origin, mutation: Mutation) -> Self {
        Self {
            sequence,
            origin,
            mutation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, FieldValue};

    fn create(id: &str) -> Mutation {
        Mutation::Create(Record::new(id, fields([("text", FieldValue::from(id))])))
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(create("p1").validate().is_ok());
        assert!(create("").validate().is_err());
        assert!(Mutation::Batch(vec![]).validate().is_err());
        assert!(Mutation::Batch(vec![Mutation::Batch(vec![create("a")])])
            .validate()
            .is_err());
        assert!(Mutation::AppendToCollection {
            collection: CollectionId::new(""),
            id: "p1".into(),
        }
        .validate()
        .is_err());

        let mut zero = Record::new("p1", Fields::new());
        zero.version = Version::new(0);
        assert!(Mutation::Create(zero).validate().is_err());
    }

    #[test]
    fn record_ids_are_deduplicated() {
        let batch = Mutation::Batch(vec![
            create("p1"),
            Mutation::AppendToCollection {
                collection: "photos".into(),
                id: "p1".into(),
            },
            Mutation::Delete { id: "p2".into() },
        ]);
        let ids: Vec<&str> = batch.record_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(batch.parts().count(), 3);
    }

    #[test]
    fn cbor_roundtrip() {
        let mutation = Mutation::Update {
            id: "p1".into(),
            fields: fields([("imageData", FieldValue::Blob(vec![1, 2, 3]))]),
            base_version: Version::new(4),
        };
        let bytes = mutation.encode().unwrap();
        assert_eq!(Mutation::decode(&bytes).unwrap(), mutation);
        assert!(Mutation::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
