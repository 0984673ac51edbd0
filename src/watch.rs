//! Trip watchers: the consumer side of the sync layer.
//!
//! A watcher is what a trip page holds while it is on screen. Mounting runs
//! the canonical fetch, wires a listener that patches the cache, joins the
//! room(s), and starts the reconciliation poller. Unmounting (explicitly or
//! by drop) undoes all of it exactly once.
//!
//! LIST RECONCILIATION
//! ===================
//! A `MyTrips` watcher holds one room per listed trip. After every successful
//! poll the held set is diffed against the fresh list: new trips are joined,
//! vanished trips are left and evicted from the cache unless another watcher
//! still holds their room.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tripsync_protocol::{EntityKey, TripRecord};

use crate::api::TripSource;
use crate::cache::SharedCache;
use crate::client::RealtimeSyncClient;
use crate::config::SyncConfig;
use crate::listeners::ListenerId;
use crate::poller::{self, WatchTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS) }
    }
}

impl From<&SyncConfig> for WatchOptions {
    fn from(config: &SyncConfig) -> Self {
        Self { poll_interval: config.poll_interval }
    }
}

type HeldRooms = Arc<Mutex<BTreeSet<EntityKey>>>;

fn lock(rooms: &HeldRooms) -> MutexGuard<'_, BTreeSet<EntityKey>> {
    rooms.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mounted view of one trip or of the user's trip list.
pub struct TripWatcher {
    target: WatchTarget,
    sync: RealtimeSyncClient,
    cache: SharedCache,
    listener: Option<ListenerId>,
    rooms: HeldRooms,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl TripWatcher {
    /// Mount a watcher. Never fails: an initial fetch error is logged and
    /// the poller keeps retrying on its interval.
    pub async fn mount(
        sync: &RealtimeSyncClient,
        source: Arc<dyn TripSource>,
        cache: SharedCache,
        target: WatchTarget,
        options: WatchOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let rooms: HeldRooms = Arc::new(Mutex::new(BTreeSet::new()));

        let initial = match poller::fetch(source.as_ref(), &target).await {
            Ok(fetched) => Some(poller::apply(&cache, fetched)),
            Err(error) => {
                warn!(watch_target = ?target, %error, "watch: initial fetch failed, poller will retry");
                None
            }
        };

        let listener = match &target {
            WatchTarget::Trip(key) => {
                let cache = cache.clone();
                let cancel = cancel.clone();
                sync.on_entity_update(key.clone(), move |update| {
                    if !cancel.is_cancelled() {
                        cache.apply_update(update);
                    }
                })
            }
            WatchTarget::MyTrips => {
                let cache = cache.clone();
                let cancel = cancel.clone();
                let rooms = Arc::clone(&rooms);
                sync.on_update(move |update| {
                    if !cancel.is_cancelled() && lock(&rooms).contains(&update.entity_id) {
                        cache.apply_update(update);
                    }
                })
            }
        };

        match &target {
            WatchTarget::Trip(key) => {
                lock(&rooms).insert(key.clone());
                sync.subscribe(key.clone());
            }
            WatchTarget::MyTrips => {
                if let Some(ids) = &initial {
                    reconcile_rooms(sync, &cache, &rooms, &cancel, ids);
                }
            }
        }

        let on_reconciled = {
            let sync = sync.clone();
            let cache = cache.clone();
            let rooms = Arc::clone(&rooms);
            let cancel = cancel.clone();
            let is_list = target == WatchTarget::MyTrips;
            move |ids: &[EntityKey]| {
                if is_list {
                    reconcile_rooms(&sync, &cache, &rooms, &cancel, ids);
                }
            }
        };
        let poller = poller::spawn_poller(
            source,
            cache.clone(),
            target.clone(),
            options.poll_interval,
            cancel.clone(),
            on_reconciled,
        );

        info!(watch_target = ?target, rooms = lock(&rooms).len(), "watch: mounted");
        Self { target, sync: sync.clone(), cache, listener: Some(listener), rooms, cancel, poller: Some(poller) }
    }

    #[must_use]
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Rooms this watcher currently holds.
    #[must_use]
    pub fn rooms(&self) -> Vec<EntityKey> {
        lock(&self.rooms).iter().cloned().collect()
    }

    /// Cached records for this watcher's trips, sorted by id.
    #[must_use]
    pub fn records(&self) -> Vec<TripRecord> {
        match &self.target {
            WatchTarget::Trip(key) => self.cache.get(key).into_iter().collect(),
            WatchTarget::MyTrips => self.rooms().iter().filter_map(|key| self.cache.get(key)).collect(),
        }
    }

    /// Cached record for a trip watcher; `None` for list watchers or before
    /// the first successful fetch.
    #[must_use]
    pub fn record(&self) -> Option<TripRecord> {
        match &self.target {
            WatchTarget::Trip(key) => self.cache.get(key),
            WatchTarget::MyTrips => None,
        }
    }

    /// Tear down and wait for the poller to stop. Once this returns no
    /// further writes from this watcher can reach the cache.
    pub async fn unmount(mut self) {
        self.teardown();
        if let Some(handle) = self.poller.take() {
            if let Err(error) = handle.await {
                warn!(watch_target = ?self.target, %error, "watch: poller task failed");
            }
        }
    }

    fn teardown(&mut self) {
        if self.cancel.is_cancelled() && self.listener.is_none() {
            return;
        }
        self.cancel.cancel();
        if let Some(id) = self.listener.take() {
            self.sync.off_update(id);
        }
        let held = std::mem::take(&mut *lock(&self.rooms));
        for key in held {
            self.sync.unsubscribe(key);
        }
        debug!(watch_target = ?self.target, "watch: unmounted");
    }
}

impl Drop for TripWatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Diff held rooms against `ids`; join new trips, leave vanished ones and
/// evict them once nobody holds them.
fn reconcile_rooms(
    sync: &RealtimeSyncClient,
    cache: &SharedCache,
    rooms: &HeldRooms,
    cancel: &CancellationToken,
    ids: &[EntityKey],
) {
    let mut held = lock(rooms);
    // Checked under the lock so teardown cannot interleave with a re-join.
    if cancel.is_cancelled() {
        return;
    }
    let fresh: BTreeSet<EntityKey> = ids.iter().cloned().collect();

    let gone: Vec<EntityKey> = held.difference(&fresh).cloned().collect();
    for key in gone {
        held.remove(&key);
        sync.unsubscribe(key.clone());
        // Another watcher may still display this trip from the shared cache.
        if sync.is_subscribed(&key) {
            debug!(entity_id = %key, "watch: left list, still held elsewhere");
        } else {
            cache.remove(&key);
        }
    }
    for key in fresh {
        if held.insert(key.clone()) {
            sync.subscribe(key);
        }
    }
}

#[cfg(test)]
#[path = "watch_test.rs"]
mod tests;
