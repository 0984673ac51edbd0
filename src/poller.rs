//! Reconciliation poller.
//!
//! DESIGN
//! ======
//! A background task refetches canonical state on a fixed interval and
//! overwrites the cache, whether or not the realtime stream is healthy. The
//! stream can look connected while an intermediary silently drops its
//! events; this loop bounds how stale the cache can get regardless.
//!
//! CANCELLATION
//! ============
//! Each fetch races the watcher's `CancellationToken`. On cancellation the
//! fetch future is dropped (aborting the HTTP request) and the result is
//! never applied. The cancel check before applying closes the window where a
//! fetch resolves in the same instant the token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tripsync_protocol::{EntityKey, TripRecord};

use crate::api::{ApiError, TripSource};
use crate::cache::SharedCache;

/// `tokio::time::interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What a watcher displays and therefore what the poller refetches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTarget {
    /// Trip detail view.
    Trip(EntityKey),
    /// The authenticated user's trip list.
    MyTrips,
}

/// Result of one canonical fetch.
#[derive(Clone, Debug, PartialEq)]
pub enum Fetched {
    One(TripRecord),
    Many(Vec<TripRecord>),
}

/// Fetch canonical state for `target`.
///
/// # Errors
///
/// Propagates the source's [`ApiError`].
pub async fn fetch(source: &dyn TripSource, target: &WatchTarget) -> Result<Fetched, ApiError> {
    match target {
        WatchTarget::Trip(key) => source.fetch_trip(key).await.map(Fetched::One),
        WatchTarget::MyTrips => source.fetch_trips().await.map(Fetched::Many),
    }
}

/// Overwrite cache entries with fetched records and return their ids.
pub fn apply(cache: &SharedCache, fetched: Fetched) -> Vec<EntityKey> {
    let records = match fetched {
        Fetched::One(record) => vec![record],
        Fetched::Many(records) => records,
    };
    let ids = records.iter().map(|r| r.id.clone()).collect();
    for record in records {
        cache.replace(record);
    }
    ids
}

/// Spawn the polling loop. The first poll happens one `interval` after spawn;
/// the mounting watcher has already performed the initial fetch.
///
/// `on_reconciled` receives the ids of every successful poll.
pub fn spawn_poller<F>(
    source: Arc<dyn TripSource>,
    cache: SharedCache,
    target: WatchTarget,
    interval: Duration,
    cancel: CancellationToken,
    on_reconciled: F,
) -> JoinHandle<()>
where
    F: Fn(&[EntityKey]) + Send + 'static,
{
    let interval = interval.max(MIN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = fetch(source.as_ref(), &target) => result,
            };
            if cancel.is_cancelled() {
                break;
            }

            match result {
                Ok(fetched) => {
                    let ids = apply(&cache, fetched);
                    debug!(watch_target = ?target, trips = ids.len(), "poller: reconciled");
                    on_reconciled(&ids);
                }
                Err(error) => warn!(watch_target = ?target, %error, "poller: fetch failed"),
            }
        }
        debug!(watch_target = ?target, "poller: stopped");
    })
}

#[cfg(test)]
#[path = "poller_test.rs"]
mod tests;
