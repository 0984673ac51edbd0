//! Local trip cache.
//!
//! Two write paths touch an entry:
//! - stream updates: partial patch, only fields present on the event are written
//! - REST reconciliation: full overwrite, always accepted
//!
//! Ordering between them is arrival order unless [`WritePolicy::RejectStale`]
//! is selected, in which case a patch older than the entry's `updatedAt` is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tripsync_protocol::{EntityKey, EntityUpdate, TripRecord};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// Every write lands in arrival order.
    #[default]
    LastWriteWins,
    /// Patches carrying a timestamp older than the cached `updatedAt` are rejected.
    RejectStale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// No cached entry for the event's entity.
    Missing,
    /// Rejected by [`WritePolicy::RejectStale`].
    Stale,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub record: TripRecord,
    /// Cache-wide write counter value at the last write to this entry.
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct TripCache {
    entries: HashMap<EntityKey, CacheEntry>,
    policy: WritePolicy,
    revision: u64,
}

impl TripCache {
    #[must_use]
    pub fn new(policy: WritePolicy) -> Self {
        Self { entries: HashMap::new(), policy, revision: 0 }
    }

    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<&TripRecord> {
        self.entries.get(key).map(|e| &e.record)
    }

    #[must_use]
    pub fn entry(&self, key: &EntityKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TripRecord> {
        self.entries.values().map(|e| &e.record)
    }

    /// Merge a stream update into the matching entry.
    pub fn apply_update(&mut self, update: &EntityUpdate) -> PatchOutcome {
        let Some(entry) = self.entries.get_mut(&update.entity_id) else {
            return PatchOutcome::Missing;
        };
        if self.policy == WritePolicy::RejectStale {
            if let (Some(incoming), Some(current)) = (update.updated_at(), entry.record.updated_at) {
                if incoming < current {
                    return PatchOutcome::Stale;
                }
            }
        }
        merge_update(&mut entry.record, update);
        self.revision += 1;
        entry.revision = self.revision;
        PatchOutcome::Applied
    }

    /// Overwrite (or insert) an entry with an authoritative record.
    pub fn replace(&mut self, record: TripRecord) {
        self.revision += 1;
        let revision = self.revision;
        self.entries.insert(record.id.clone(), CacheEntry { record, revision });
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<TripRecord> {
        let removed = self.entries.remove(key)?;
        self.revision += 1;
        Some(removed.record)
    }
}

/// Keys a record carries as typed fields or identity; never copied into
/// `record.fields`.
const RESERVED_KEYS: [&str; 7] = ["id", "_id", "entityId", "status", "paymentStatus", "updatedAt", "timestamp"];

/// Write the fields present on `update` into `record`; leave the rest alone.
pub fn merge_update(record: &mut TripRecord, update: &EntityUpdate) {
    if let Some(status) = &update.status {
        record.status.clone_from(status);
    }
    if let Some(payment_status) = &update.payment_status {
        record.payment_status = Some(payment_status.clone());
    }
    if let Some(ts) = update.updated_at() {
        record.updated_at = Some(ts);
    }
    for (key, value) in &update.fields {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            record.fields.insert(key.clone(), value.clone());
        }
    }
}

// =============================================================================
// SHARED CACHE
// =============================================================================

/// Thread-safe cache handle shared by listeners, pollers and views.
///
/// Every accepted write publishes the new cache revision on a `watch`
/// channel so a view can re-render without polling the cache.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<TripCache>>,
    revision_tx: Arc<watch::Sender<u64>>,
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new(WritePolicy::default())
    }
}

impl SharedCache {
    #[must_use]
    pub fn new(policy: WritePolicy) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self { inner: Arc::new(Mutex::new(TripCache::new(policy))), revision_tx: Arc::new(revision_tx) }
    }

    fn lock(&self) -> MutexGuard<'_, TripCache> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, revision: u64) {
        self.revision_tx.send_replace(revision);
    }

    pub fn apply_update(&self, update: &EntityUpdate) -> PatchOutcome {
        let (outcome, revision) = {
            let mut cache = self.lock();
            let outcome = cache.apply_update(update);
            (outcome, cache.revision())
        };
        if outcome == PatchOutcome::Applied {
            self.publish(revision);
        }
        outcome
    }

    pub fn replace(&self, record: TripRecord) {
        let revision = {
            let mut cache = self.lock();
            cache.replace(record);
            cache.revision()
        };
        self.publish(revision);
    }

    pub fn remove(&self, key: &EntityKey) -> Option<TripRecord> {
        let (removed, revision) = {
            let mut cache = self.lock();
            let removed = cache.remove(key);
            (removed, cache.revision())
        };
        if removed.is_some() {
            self.publish(revision);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<TripRecord> {
        self.lock().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.lock().contains(key)
    }

    /// All cached records, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TripRecord> {
        let mut records: Vec<_> = self.lock().records().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.lock().revision()
    }

    /// Receiver notified with the cache revision after every accepted write.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
