//! Collection handles and write transactions.

use crate::database::Database;
use crate::error::CoreResult;
use crate::mutation::Mutation;
use crate::notifier::{ChangeEvent, Subscription};
use crate::record::{Fields, Record};
use crate::types::{CollectionId, RecordId, SequenceNumber, Version};
use std::sync::Arc;

/// Mutations gathered inside [`Database::transaction`].
///
/// Nothing is written until the closure returns `Ok`; the gathered
/// mutations then become one log entry and one change event.
#[derive(Debug, Default)]
pub struct Transaction {
    mutations: Vec<Mutation>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stages a new record and returns its id.
    pub fn create(&mut self, record: Record) -> RecordId {
        let id = record.id.clone();
        self.mutations.push(Mutation::Create(record));
        id
    }

    /// Stages a field update based on `base_version`.
    pub fn update(&mut self, id: impl Into<RecordId>, fields: Fields, base_version: Version) {
        self.mutations.push(Mutation::Update {
            id: id.into(),
            fields,
            base_version,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, id: impl Into<RecordId>) {
        self.mutations.push(Mutation::Delete { id: id.into() });
    }

    /// Stages appending `id` to `collection`.
    pub fn append_to(&mut self, collection: impl Into<CollectionId>, id: impl Into<RecordId>) {
        self.mutations.push(Mutation::AppendToCollection {
            collection: collection.into(),
            id: id.into(),
        });
    }

    /// Number of staged mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns `true` if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// The single mutation to log, or `None` for an empty transaction.
    pub(crate) fn into_mutation(mut self) -> Option<Mutation> {
        match self.mutations.len() {
            0 => None,
            1 => self.mutations.pop(),
            _ => Some(Mutation::Batch(self.mutations)),
        }
    }
}

/// A live, ordered view over one collection.
///
/// The handle stores only the collection id; every read goes to the object
/// store, so it always reflects the latest applied entry. Concurrent appends
/// are ordered by the durable log.
#[derive(Debug, Clone)]
pub struct CollectionHandle<'db> {
    db: &'db Database,
    id: CollectionId,
}

impl<'db> CollectionHandle<'db> {
    pub(crate) fn new(db: &'db Database, id: CollectionId) -> Self {
        Self { db, id }
    }

    /// The collection id.
    #[must_use]
    pub fn id(&self) -> &CollectionId {
        &self.id
    }

    /// Live members in collection order.
    #[must_use]
    pub fn items(&self) -> Vec<Arc<Record>> {
        self.db.store().list_collection(&self.id)
    }

    /// Number of live members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Returns `true` if the collection has no live members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a record with a generated id and appends it, in one
    /// transaction. Returns the record as written.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails; nothing becomes visible in
    /// that case.
    pub fn append(&self, fields: Fields) -> CoreResult<Record> {
        let record = Record::with_generated_id(fields);
        self.append_record(record.clone())?;
        Ok(record)
    }

    /// Creates `record` and appends it, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is malformed or the log write fails.
    pub fn append_record(&self, record: Record) -> CoreResult<SequenceNumber> {
        self.db
            .transaction(|txn| {
                let id = txn.create(record);
                txn.append_to(self.id.clone(), id);
                Ok(())
            })
            .map(|((), seq)| seq.unwrap_or_default())
    }

    /// Appends an existing record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails.
    pub fn add_existing(&self, id: impl Into<RecordId>) -> CoreResult<SequenceNumber> {
        self.db.append(Mutation::AppendToCollection {
            collection: self.id.clone(),
            id: id.into(),
        })
    }

    /// Subscribes to events touching this collection.
    pub fn on_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.db.on_collection_changed(self.id.clone(), callback)
    }
}
