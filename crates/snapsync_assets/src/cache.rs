//! Two-tier decoded asset cache.
//!
//! Tier one holds decoded images in memory keyed by record id, each tagged
//! with the record version it was decoded from. Tier two is the record's
//! persisted `imageData` field, decoded on a miss. A lookup whose tag does
//! not match the record's current version decodes again.

use crate::encode::decode_asset;
use crate::error::AssetResult;
use crate::photo::IMAGE_FIELD;
use image::DynamicImage;
use parking_lot::RwLock;
use snapsync_core::{ChangeKind, Database, Record, RecordId, Subscription, Version};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that decoded the persisted field.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Decoded image cache keyed by record id.
#[derive(Default)]
pub struct AssetCache {
    entries: RwLock<HashMap<RecordId, (Version, Arc<DynamicImage>)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AssetCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the decoded image of `record`, or `None` if it carries no
    /// image.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted payload does not decode.
    pub fn image(&self, record: &Record) -> AssetResult<Option<Arc<DynamicImage>>> {
        if let Some((version, image)) = self.entries.read().get(&record.id) {
            if *version == record.version {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(Arc::clone(image)));
            }
        }

        let Some(bytes) = record.blob(IMAGE_FIELD) else {
            self.invalidate(&record.id);
            return Ok(None);
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        let image = Arc::new(decode_asset(bytes)?);
        tracing::debug!(id = %record.id, version = %record.version, "decoded asset");
        self.entries
            .write()
            .insert(record.id.clone(), (record.version, Arc::clone(&image)));
        Ok(Some(image))
    }

    /// Looks up `id` in `db` and returns its decoded image.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted payload does not decode.
    pub fn image_by_id(&self, db: &Database, id: &RecordId) -> AssetResult<Option<Arc<DynamicImage>>> {
        match db.store().get_live(id) {
            Some(record) => self.image(&record),
            None => {
                self.invalidate(id);
                Ok(None)
            }
        }
    }

    /// Drops the entry for `id`. Returns `true` if one was held.
    pub fn invalidate(&self, id: &RecordId) -> bool {
        self.entries.write().remove(id).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of held entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Evicts entries as soon as their record changes in `db`.
    ///
    /// The subscription holds the cache weakly; dropping the returned
    /// [`Subscription`] or the last `Arc` ends eviction.
    pub fn attach(self: &Arc<Self>, db: &Database) -> Subscription {
        let cache: Weak<Self> = Arc::downgrade(self);
        db.subscribe(move |event| {
            let Some(cache) = cache.upgrade() else {
                return;
            };
            for change in &event.changes {
                if matches!(change.kind, ChangeKind::Appended | ChangeKind::Discarded) {
                    continue;
                }
                if cache.invalidate(&change.id) {
                    tracing::debug!(id = %change.id, "evicted asset");
                }
            }
        })
    }
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("stats", &self.stats())
            .finish()
    }
}
