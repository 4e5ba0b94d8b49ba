//! The database facade: log, store and notifier composed behind one
//! append path.

use crate::collection::{CollectionHandle, Transaction};
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::log::{DurableLog, LogHeader, LogReplay};
use crate::mutation::{LogEntry, Mutation};
use crate::notifier::{ChangeEvent, ChangeNotifier, Subscription};
use crate::record::{Fields, Record};
use crate::snapshot::StoreSnapshot;
use crate::store::{ApplyOutcome, ObjectStore};
use crate::types::{CollectionId, Origin, RecordId, SequenceNumber};
use parking_lot::Mutex;
use serde::Serialize;
use snapsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;

/// Summary numbers for tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    /// Newest sequence number.
    pub last_sequence: u64,
    /// Entries still in the log file.
    pub log_entries: usize,
    /// Log file size in bytes.
    pub log_bytes: u64,
    /// Last compacted sequence number.
    pub last_compacted: u64,
    /// Acknowledged watermark.
    pub ack_watermark: u64,
    /// Remote cursor.
    pub remote_cursor: u64,
    /// Live records.
    pub live_records: usize,
    /// Tombstones.
    pub tombstones: usize,
    /// Known collections.
    pub collections: usize,
}

/// A local-first object database.
///
/// Every write, local or remote, goes through the same path: append to the
/// durable log, apply to the object store, then notify subscribers. The
/// write lock covers the first two steps so store and notifier observe
/// exactly the log order.
///
/// # Example
///
/// ```rust
/// use snapsync_core::{fields, Database, FieldValue};
///
/// let db = Database::open_in_memory().unwrap();
/// db.submit("photos", fields([("text", FieldValue::from("Cat"))])).unwrap();
///
/// let items = db.current_items("photos");
/// assert_eq!(items[0].text("text"), Some("Cat"));
/// ```
pub struct Database {
    dir: Option<DatabaseDir>,
    log: DurableLog,
    store: ObjectStore,
    notifier: ChangeNotifier,
    snapshot: Mutex<Box<dyn StorageBackend>>,
    write_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
}

impl Database {
    /// Opens (or creates) a database directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked, missing (without
    /// `create_if_missing`), already populated (with `error_if_exists`), or
    /// its files are damaged.
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        if config.error_if_exists && DatabaseDir::exists(path) {
            return Err(CoreError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let log = FileBackend::open(&dir.log_path())?;
        let header = FileBackend::open(&dir.header_path())?;
        let snapshot = FileBackend::open(&dir.snapshot_path())?;

        let mut db = Self::open_with_backends(
            Box::new(log),
            Box::new(header),
            Box::new(snapshot),
            &config,
        )?;
        tracing::info!(path = %dir.path().display(), "database opened");
        db.dir = Some(dir);
        Ok(db)
    }

    /// Opens a throwaway database held in memory.
    ///
    /// # Errors
    ///
    /// Does not fail in practice; the signature matches [`Database::open`].
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backends(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            &Config::default(),
        )
    }

    /// Opens a database over explicit backends for the log, its header and
    /// the compaction snapshot.
    ///
    /// Loads the snapshot, then replays the log on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the three stores is damaged.
    pub fn open_with_backends(
        log: Box<dyn StorageBackend>,
        header: Box<dyn StorageBackend>,
        snapshot: Box<dyn StorageBackend>,
        config: &Config,
    ) -> CoreResult<Self> {
        let log = DurableLog::open(log, header, config.sync_on_append)?;
        let store = match StoreSnapshot::decode(&snapshot.read_all()?)? {
            Some(snap) => ObjectStore::from_snapshot(snap),
            None => ObjectStore::new(),
        };

        let mut replayed = 0usize;
        for entry in log.replay_from(SequenceNumber::ZERO) {
            if let ApplyOutcome::Applied(_) = store.apply(&entry?) {
                replayed += 1;
            }
        }
        tracing::debug!(
            replayed,
            applied_through = %store.applied_through(),
            "object store rebuilt"
        );

        Ok(Self {
            dir: None,
            log,
            store,
            notifier: ChangeNotifier::new(),
            snapshot: Mutex::new(snapshot),
            write_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
        })
    }

    /// Directory path, for file-backed databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DatabaseDir::path)
    }

    /// The durable log.
    #[must_use]
    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    /// The object store.
    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The change notifier.
    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Logs and applies a local mutation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedMutation`] or a storage error. Nothing
    /// is applied if the append fails.
    pub fn append(&self, mutation: Mutation) -> CoreResult<SequenceNumber> {
        self.commit(Origin::Local, mutation)
    }

    /// Logs and applies a mutation received from the remote authority.
    ///
    /// # Errors
    ///
    /// Same as [`Database::append`].
    pub fn ingest_remote(&self, mutation: Mutation) -> CoreResult<SequenceNumber> {
        self.commit(Origin::Remote, mutation)
    }

    fn commit(&self, origin: Origin, mutation: Mutation) -> CoreResult<SequenceNumber> {
        let sequence = {
            let _write = self.write_lock.lock();
            let sequence = self.log.append(origin, &mutation)?;
            let entry = LogEntry::new(sequence, origin, mutation);
            if let ApplyOutcome::Applied(applied) = self.store.apply(&entry) {
                self.notifier.enqueue(ChangeEvent {
                    sequence,
                    origin,
                    changes: applied.changes,
                    conflicts: applied.conflicts,
                    collections: applied.collections,
                });
            }
            sequence
        };
        self.notifier.drain();
        Ok(sequence)
    }

    /// Runs `f` against a fresh transaction and commits what it staged as a
    /// single log entry. Returns `f`'s value and the entry's sequence number
    /// (`None` if nothing was staged).
    ///
    /// # Errors
    ///
    /// Returns `f`'s error without writing anything, or the commit error.
    pub fn transaction<T, F>(&self, f: F) -> CoreResult<(T, Option<SequenceNumber>)>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = Transaction::new();
        let value = f(&mut txn)?;
        let sequence = match txn.into_mutation() {
            Some(mutation) => Some(self.append(mutation)?),
            None => None,
        };
        Ok((value, sequence))
    }

    /// Returns a handle on `collection`.
    pub fn collection(&self, collection: impl Into<CollectionId>) -> CollectionHandle<'_> {
        CollectionHandle::new(self, collection.into())
    }

    /// Creates a record with a generated id in `collection` and returns the
    /// logged mutation once it is durable. Upload happens later.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails. The UI shows
    /// [`CoreError::user_message`].
    pub fn submit(
        &self,
        collection: impl Into<CollectionId>,
        fields: Fields,
    ) -> CoreResult<Mutation> {
        self.submit_record(collection, Record::with_generated_id(fields))
    }

    /// Like [`Database::submit`] with a caller-chosen record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is malformed or the log write fails.
    pub fn submit_record(
        &self,
        collection: impl Into<CollectionId>,
        record: Record,
    ) -> CoreResult<Mutation> {
        let id = record.id.clone();
        let mutation = Mutation::Batch(vec![
            Mutation::Create(record),
            Mutation::AppendToCollection {
                collection: collection.into(),
                id,
            },
        ]);
        self.append(mutation.clone())?;
        Ok(mutation)
    }

    /// Live members of `collection` in order.
    #[must_use]
    pub fn current_items(&self, collection: impl Into<CollectionId>) -> Vec<Arc<Record>> {
        self.store.list_collection(&collection.into())
    }

    /// Subscribes to events touching `collection`.
    pub fn on_collection_changed<F>(
        &self,
        collection: impl Into<CollectionId>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let collection = collection.into();
        self.notifier.subscribe(move |event| {
            if event.touches(&collection) {
                callback(event);
            }
        })
    }

    /// Subscribes to every event.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Returns the record with `id`, tombstones included.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Arc<Record>> {
        self.store.get(id)
    }

    /// Updates fields of a live record, based on its current version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordNotFound`] if there is no live record, or
    /// a log error.
    pub fn update(&self, id: &RecordId, fields: Fields) -> CoreResult<SequenceNumber> {
        let current = self
            .store
            .get_live(id)
            .ok_or_else(|| CoreError::record_not_found(id))?;
        self.append(Mutation::Update {
            id: id.clone(),
            fields,
            base_version: current.version,
        })
    }

    /// Tombstones a live record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordNotFound`] if there is no live record, or
    /// a log error.
    pub fn delete(&self, id: &RecordId) -> CoreResult<SequenceNumber> {
        if self.store.get_live(id).is_none() {
            return Err(CoreError::record_not_found(id));
        }
        self.append(Mutation::Delete { id: id.clone() })
    }

    /// Replays log entries from `from`.
    #[must_use]
    pub fn replay_from(&self, from: SequenceNumber) -> LogReplay {
        self.log.replay_from(from)
    }

    /// Entries after the acknowledged watermark, local and remote alike.
    /// Uploaders skip remote-origin entries.
    #[must_use]
    pub fn pending_upload(&self) -> LogReplay {
        self.log.replay_from(self.log.ack_watermark().next())
    }

    /// Acknowledged watermark.
    #[must_use]
    pub fn ack_watermark(&self) -> SequenceNumber {
        self.log.ack_watermark()
    }

    /// Advances the acknowledged watermark. Returns `true` if it moved.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the header cannot be written.
    pub fn acknowledge(&self, up_to: SequenceNumber) -> CoreResult<bool> {
        self.log.acknowledge(up_to)
    }

    /// Highest remote sequence ingested.
    #[must_use]
    pub fn remote_cursor(&self) -> u64 {
        self.log.header().remote_cursor
    }

    /// Records the highest remote sequence ingested.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the header cannot be written.
    pub fn set_remote_cursor(&self, cursor: u64) -> CoreResult<()> {
        self.log.set_remote_cursor(cursor)
    }

    /// Number of acknowledged entries still in the log file.
    #[must_use]
    pub fn compactable_entries(&self) -> u64 {
        let header = self.log.header();
        header
            .ack_watermark
            .as_u64()
            .saturating_sub(header.last_compacted.as_u64())
    }

    /// Folds every acknowledged entry into the snapshot and drops it from
    /// the log. Returns the number of entries dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error. A failure before the log rewrite
    /// leaves the log untouched.
    pub fn compact(&self) -> CoreResult<usize> {
        let _compaction = self.compaction_lock.lock();
        let LogHeader {
            last_compacted,
            ack_watermark: through,
            ..
        } = self.log.header();
        if through <= last_compacted {
            return Ok(0);
        }

        let mut snapshot = self.snapshot.lock();
        let folded = match StoreSnapshot::decode(&snapshot.read_all()?)? {
            Some(snap) => ObjectStore::from_snapshot(snap),
            None => ObjectStore::new(),
        };
        for entry in self.log.replay_from(last_compacted.next()) {
            let entry = entry?;
            if entry.sequence > through {
                break;
            }
            folded.apply(&entry);
        }
        snapshot.replace(&folded.snapshot().encode()?)?;
        drop(snapshot);

        self.log.compact_through(through)
    }

    /// Summary numbers.
    ///
    /// # Errors
    ///
    /// Returns an error if the log size cannot be read.
    pub fn stats(&self) -> CoreResult<DatabaseStats> {
        let header = self.log.header();
        let (live_records, tombstones) = self.store.record_counts();
        Ok(DatabaseStats {
            last_sequence: self.log.last_sequence().as_u64(),
            log_entries: self.log.entry_count(),
            log_bytes: self.log.size()?,
            last_compacted: header.last_compacted.as_u64(),
            ack_watermark: header.ack_watermark.as_u64(),
            remote_cursor: header.remote_cursor,
            live_records,
            tombstones,
            collections: self.store.collection_ids().len(),
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, FieldValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn text(value: &str) -> Fields {
        fields([("text", FieldValue::from(value))])
    }

    #[test]
    fn submit_is_visible_immediately() {
        let db = Database::open_in_memory().unwrap();
        let mutation = db.submit("photos", text("Cat")).unwrap();

        let Mutation::Batch(parts) = &mutation else {
            panic!("submit logs a batch");
        };
        let Mutation::Create(record) = &parts[0] else {
            panic!("batch starts with the create");
        };
        let items = db.current_items("photos");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, record.id);
        assert_eq!(items[0].text("text"), Some("Cat"));
        assert_eq!(db.ack_watermark(), SequenceNumber::ZERO);
    }

    #[test]
    fn submit_record_keeps_caller_id() {
        let db = Database::open_in_memory().unwrap();
        db.submit_record("photos", Record::new("p1", text("Cat"))).unwrap();
        assert_eq!(db.current_items("photos")[0].id.as_str(), "p1");
    }

    #[test]
    fn collection_callback_fires_once_per_entry() {
        let db = Database::open_in_memory().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = db.on_collection_changed("photos", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        db.submit("photos", text("a")).unwrap();
        db.submit("albums", text("b")).unwrap();
        let id = db.current_items("photos")[0].id.clone();
        db.update(&id, text("a2")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callbacks_see_applied_state_and_may_write() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&db);
        let sink = Arc::clone(&seen);
        let _sub = db.subscribe(move |event| {
            let Some(db) = weak.upgrade() else { return };
            sink.lock().push(db.current_items("photos").len());
            if event.sequence == SequenceNumber::new(1) {
                db.submit("photos", text("echo")).unwrap();
            }
        });

        db.submit("photos", text("first")).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let result = db.transaction(|txn| {
            txn.create(Record::new("p1", text("a")));
            Err::<(), _>(CoreError::invalid_operation("user cancelled"))
        });
        assert!(result.is_err());
        assert_eq!(db.log().last_sequence(), SequenceNumber::ZERO);

        let ((), seq) = db.transaction(|_| Ok(())).unwrap();
        assert!(seq.is_none());
    }

    #[test]
    fn update_and_delete_require_live_record() {
        let db = Database::open_in_memory().unwrap();
        let missing = RecordId::from("nope");
        assert!(matches!(
            db.update(&missing, text("x")),
            Err(CoreError::RecordNotFound { .. })
        ));

        db.submit_record("photos", Record::new("p1", text("a"))).unwrap();
        db.delete(&"p1".into()).unwrap();
        assert!(db.current_items("photos").is_empty());
        assert!(db.delete(&"p1".into()).is_err());
    }

    #[test]
    fn reopen_restores_state() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), Config::default()).unwrap();
            db.submit_record("photos", Record::new("p1", text("Cat"))).unwrap();
            db.submit_record("photos", Record::new("p2", text("Dog"))).unwrap();
            db.update(&"p1".into(), text("Lion")).unwrap();
        }
        let db = Database::open(dir.path(), Config::default()).unwrap();
        let items = db.current_items("photos");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text("text"), Some("Lion"));
        assert_eq!(items[0].version.as_u64(), 2);
    }

    #[test]
    fn second_open_is_locked_and_error_if_exists_is_honoured() {
        let dir = tempdir().unwrap();
        let _db = Database::open(dir.path(), Config::default()).unwrap();
        assert!(matches!(
            Database::open(dir.path(), Config::default()),
            Err(CoreError::DatabaseLocked)
        ));
        assert!(matches!(
            Database::open(dir.path(), Config::default().error_if_exists(true)),
            Err(CoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn compaction_folds_acknowledged_prefix() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), Config::default()).unwrap();
            for id in ["p1", "p2", "p3"] {
                db.submit_record("photos", Record::new(id, text(id))).unwrap();
            }
            db.acknowledge(SequenceNumber::new(2)).unwrap();
            assert_eq!(db.compactable_entries(), 2);
            assert_eq!(db.compact().unwrap(), 2);
            assert_eq!(db.compact().unwrap(), 0);
            assert_eq!(db.log().entry_count(), 1);
            assert_eq!(db.current_items("photos").len(), 3);
        }

        let db = Database::open(dir.path(), Config::default()).unwrap();
        let ids: Vec<_> = db
            .current_items("photos")
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        let stats = db.stats().unwrap();
        assert_eq!(stats.last_compacted, 2);
        assert_eq!(stats.log_entries, 1);
        assert_eq!(stats.live_records, 3);
    }

    #[test]
    fn pending_upload_starts_after_watermark() {
        let db = Database::open_in_memory().unwrap();
        for id in ["p1", "p2", "p3"] {
            db.submit_record("photos", Record::new(id, text(id))).unwrap();
        }
        db.acknowledge(SequenceNumber::new(1)).unwrap();
        let pending: Vec<_> = db
            .pending_upload()
            .map(|e| e.unwrap().sequence.as_u64())
            .collect();
        assert_eq!(pending, vec![2, 3]);
    }
}
