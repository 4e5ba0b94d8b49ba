//! Object store: the in-memory materialized view of the durable log.

use crate::mutation::{LogEntry, Mutation};
use crate::record::{Fields, Record};
use crate::snapshot::{SnapshotRecord, StoreSnapshot};
use crate::types::{CollectionId, Origin, RecordId, SequenceNumber, Version};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What happened to one record while applying an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new record was installed.
    Created,
    /// Fields or version changed.
    Updated,
    /// The record became a tombstone.
    Deleted,
    /// The record was added to a collection.
    Appended,
    /// The mutation lost a conflict; state is unchanged.
    Discarded,
}

/// One record-level change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    /// The record.
    pub id: RecordId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Version after the change.
    pub version: Version,
}

/// A version conflict the store resolved on its own.
///
/// Conflicts are never returned as errors; they show up in the apply
/// outcome and in debug logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Contested record.
    pub id: RecordId,
    /// Origin of the incoming mutation.
    pub incoming_origin: Origin,
    /// Version the incoming mutation would have produced.
    pub incoming_version: Version,
    /// Origin of the write the store held.
    pub current_origin: Origin,
    /// Version the store held.
    pub current_version: Version,
    /// Whether the incoming mutation replaced the stored state.
    pub incoming_won: bool,
}

/// Result of applying one log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry was applied. Conflicts it lost appear as `Discarded`
    /// changes.
    Applied(Applied),
    /// The sequence number was already applied; nothing changed.
    Duplicate,
}

/// Details of an applied entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Record changes in mutation order.
    pub changes: Vec<RecordChange>,
    /// Conflicts met along the way.
    pub conflicts: Vec<Conflict>,
    /// Collections whose visible contents may have changed.
    pub collections: Vec<CollectionId>,
}

#[derive(Debug, Clone)]
struct Slot {
    record: Arc<Record>,
    origin: Origin,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<RecordId, Slot>,
    collections: HashMap<CollectionId, Vec<RecordId>>,
    memberships: HashMap<RecordId, Vec<CollectionId>>,
    applied_through: SequenceNumber,
}

/// In-memory record set built by applying log entries in order.
///
/// Writers hold the write lock for the whole entry, so a batch becomes
/// visible at once. Readers clone `Arc<Record>` values under a short read
/// lock; a record value never changes after it is installed.
#[derive(Debug, Default)]
pub struct ObjectStore {
    state: RwLock<StoreState>,
}

impl ObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from a compaction snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState {
            applied_through: snapshot.applied_through,
            ..StoreState::default()
        };
        for SnapshotRecord { record, origin } in snapshot.records {
            state.records.insert(
                record.id.clone(),
                Slot {
                    record: Arc::new(record),
                    origin,
                },
            );
        }
        for (collection, members) in snapshot.collections {
            for id in &members {
                state
                    .memberships
                    .entry(id.clone())
                    .or_default()
                    .push(collection.clone());
            }
            state.collections.insert(collection, members);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Captures the complete state.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .records
            .values()
            .map(|slot| SnapshotRecord {
                record: (*slot.record).clone(),
                origin: slot.origin,
            })
            .collect();
        records.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        let mut collections: Vec<_> = state
            .collections
            .iter()
            .map(|(id, members)| (id.clone(), members.clone()))
            .collect();
        collections.sort_by(|a, b| a.0.cmp(&b.0));

        StoreSnapshot {
            applied_through: state.applied_through,
            records,
            collections,
        }
    }

    /// Applies one log entry.
    ///
    /// Entries at or below [`ObjectStore::applied_through`] are ignored, so
    /// replaying the same entry twice is a no-op.
    pub fn apply(&self, entry: &LogEntry) -> ApplyOutcome {
        let mut state = self.state.write();
        if entry.sequence <= state.applied_through {
            return ApplyOutcome::Duplicate;
        }

        let mut applied = Applied::default();
        for part in entry.mutation.parts() {
            state.apply_part(part, entry.origin, &mut applied);
        }
        state.applied_through = entry.sequence;

        for conflict in &applied.conflicts {
            tracing::debug!(
                sequence = %entry.sequence,
                id = %conflict.id,
                incoming = %conflict.incoming_version,
                current = %conflict.current_version,
                incoming_origin = %conflict.incoming_origin,
                incoming_won = conflict.incoming_won,
                "version conflict resolved"
            );
        }

        let mut collections = std::mem::take(&mut applied.collections);
        for change in &applied.changes {
            if change.kind == ChangeKind::Discarded {
                continue;
            }
            if let Some(member_of) = state.memberships.get(&change.id) {
                collections.extend(member_of.iter().cloned());
            }
        }
        collections.sort();
        collections.dedup();
        applied.collections = collections;

        ApplyOutcome::Applied(applied)
    }

    /// Returns the record with `id`, tombstones included.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Arc<Record>> {
        self.state
            .read()
            .records
            .get(id)
            .map(|slot| Arc::clone(&slot.record))
    }

    /// Returns the record with `id` unless it is missing or a tombstone.
    #[must_use]
    pub fn get_live(&self, id: &RecordId) -> Option<Arc<Record>> {
        self.get(id).filter(|record| record.is_live())
    }

    /// Returns the live members of a collection in order.
    ///
    /// Members whose record is a tombstone are pruned from the collection.
    /// Members whose record has not arrived yet are skipped but kept.
    #[must_use]
    pub fn list_collection(&self, collection: &CollectionId) -> Vec<Arc<Record>> {
        let (items, tombstoned) = {
            let state = self.state.read();
            let Some(members) = state.collections.get(collection) else {
                return Vec::new();
            };
            let mut items = Vec::with_capacity(members.len());
            let mut tombstoned = Vec::new();
            for id in members {
                match state.records.get(id) {
                    Some(slot) if slot.record.is_live() => items.push(Arc::clone(&slot.record)),
                    Some(_) => tombstoned.push(id.clone()),
                    None => {}
                }
            }
            (items, tombstoned)
        };

        if !tombstoned.is_empty() {
            let mut state = self.state.write();
            state.prune(collection, &tombstoned);
        }
        items
    }

    /// Number of ids currently listed as members, dangling ones included.
    #[must_use]
    pub fn member_count(&self, collection: &CollectionId) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, Vec::len)
    }

    /// Collections the store knows about, sorted by name.
    #[must_use]
    pub fn collection_ids(&self) -> Vec<CollectionId> {
        let mut ids: Vec<_> = self.state.read().collections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Collections `id` is a member of.
    #[must_use]
    pub fn memberships(&self, id: &RecordId) -> Vec<CollectionId> {
        self.state
            .read()
            .memberships
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest sequence number applied.
    #[must_use]
    pub fn applied_through(&self) -> SequenceNumber {
        self.state.read().applied_through
    }

    /// `(live, tombstoned)` record counts.
    #[must_use]
    pub fn record_counts(&self) -> (usize, usize) {
        let state = self.state.read();
        let live = state.records.values().filter(|s| s.record.is_live()).count();
        (live, state.records.len() - live)
    }
}

impl StoreState {
    fn apply_part(&mut self, part: &Mutation, origin: Origin, applied: &mut Applied) {
        match part {
            Mutation::Create(record) => self.create(record, origin, applied),
            Mutation::Update {
                id,
                fields,
                base_version,
            } => self.update(id, fields, *base_version, origin, applied),
            Mutation::Delete { id } => self.delete(id, origin, applied),
            Mutation::AppendToCollection { collection, id } => {
                let members = self.collections.entry(collection.clone()).or_default();
                if members.contains(id) {
                    return;
                }
                members.push(id.clone());
                self.memberships
                    .entry(id.clone())
                    .or_default()
                    .push(collection.clone());
                let version = self
                    .records
                    .get(id)
                    .map(|slot| slot.record.version)
                    .unwrap_or_default();
                applied.changes.push(RecordChange {
                    id: id.clone(),
                    kind: ChangeKind::Appended,
                    version,
                });
                applied.collections.push(collection.clone());
            }
            Mutation::Batch(_) => {
                // Nested batches are rejected before they reach the log.
                tracing::warn!("ignoring nested batch");
            }
        }
    }

    fn create(&mut self, record: &Record, origin: Origin, applied: &mut Applied) {
        let Some(slot) = self.records.get(&record.id) else {
            self.install(record.clone(), origin, ChangeKind::Created, applied);
            return;
        };

        let current = slot.record.version;
        if self.resolve(&record.id, record.version, origin, applied) {
            let mut winner = record.clone();
            winner.version = record.version.max(current.next());
            self.install(winner, origin, ChangeKind::Updated, applied);
        }
    }

    fn update(
        &mut self,
        id: &RecordId,
        fields: &Fields,
        base: Version,
        origin: Origin,
        applied: &mut Applied,
    ) {
        let Some(slot) = self.records.get(id) else {
            discard(id, Version::default(), applied);
            return;
        };
        let current = Arc::clone(&slot.record);
        if !current.is_live() {
            discard(id, current.version, applied);
            return;
        }

        let proposed = base.next();
        if base < current.version && !self.resolve(id, proposed, origin, applied) {
            return;
        }

        let mut next = (*current).clone();
        next.fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        next.version = proposed.max(current.version.next());
        self.install(next, origin, ChangeKind::Updated, applied);
    }

    fn delete(&mut self, id: &RecordId, origin: Origin, applied: &mut Applied) {
        let Some(slot) = self.records.get(id) else {
            discard(id, Version::default(), applied);
            return;
        };
        if !slot.record.is_live() {
            return;
        }
        let mut tombstone = (*slot.record).clone();
        tombstone.deleted = true;
        tombstone.version = tombstone.version.next();
        self.install(tombstone, origin, ChangeKind::Deleted, applied);
    }

    /// Decides a conflict between an incoming write producing `proposed`
    /// and the stored record. Higher version wins; on a tie a remote write
    /// beats a local one. Returns `true` if the incoming write wins.
    fn resolve(
        &self,
        id: &RecordId,
        proposed: Version,
        origin: Origin,
        applied: &mut Applied,
    ) -> bool {
        let Some(slot) = self.records.get(id) else {
            return true;
        };
        let current = slot.record.version;
        let incoming_won = proposed > current
            || (proposed == current && origin == Origin::Remote && slot.origin == Origin::Local);

        applied.conflicts.push(Conflict {
            id: id.clone(),
            incoming_origin: origin,
            incoming_version: proposed,
            current_origin: slot.origin,
            current_version: current,
            incoming_won,
        });
        if !incoming_won {
            discard(id, current, applied);
        }
        incoming_won
    }

    fn install(&mut self, record: Record, origin: Origin, kind: ChangeKind, applied: &mut Applied) {
        applied.changes.push(RecordChange {
            id: record.id.clone(),
            kind,
            version: record.version,
        });
        self.records.insert(
            record.id.clone(),
            Slot {
                record: Arc::new(record),
                origin,
            },
        );
    }

    fn prune(&mut self, collection: &CollectionId, ids: &[RecordId]) {
        if let Some(members) = self.collections.get_mut(collection) {
            members.retain(|id| !ids.contains(id));
        }
        for id in ids {
            if let Some(member_of) = self.memberships.get_mut(id) {
                member_of.retain(|c| c != collection);
                if member_of.is_empty() {
                    self.memberships.remove(id);
                }
            }
        }
        tracing::debug!(%collection, pruned = ids.len(), "pruned tombstoned members");
    }
}

fn discard(id: &RecordId, version: Version, applied: &mut Applied) {
    applied.changes.push(RecordChange {
        id: id.clone(),
        kind: ChangeKind::Discarded,
        version,
    });
}
