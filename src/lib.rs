//! Real-time trip status sync for the booking client.
//!
//! This crate keeps a local view of trips consistent with the backend while a
//! trip page is on screen. It combines a push channel (room subscriptions over
//! WebSocket), a REST poller that periodically refetches canonical state, and
//! a cache that accepts partial patches from the former and full overwrites
//! from the latter.
//!
//! Typical wiring:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use tripsync::{ApiClient, Credential, RealtimeSyncClient, SharedCache, SyncConfig, TripWatcher, WatchOptions, WatchTarget};
//!
//! let config = SyncConfig::from_env()?;
//! let credential = Credential::bearer("token");
//! let sync = RealtimeSyncClient::websocket(config.realtime_url.clone(), config.reconnect);
//! sync.connect(credential.clone());
//!
//! let api = Arc::new(ApiClient::from_config(&config, &credential)?);
//! let cache = SharedCache::default();
//! let watcher = TripWatcher::mount(&sync, api, cache, WatchTarget::Trip("trip-1".into()), WatchOptions::from(&config)).await;
//! // ... render watcher.record() on every cache change ...
//! watcher.unmount().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod listeners;
pub mod poller;
pub mod rooms;
pub mod transport;
pub mod watch;

#[cfg(test)]
mod test_helpers;

pub use api::{ApiClient, ApiError, TripSource};
pub use cache::{PatchOutcome, SharedCache, TripCache, WritePolicy};
pub use client::{ConnectionStatus, RealtimeSyncClient, ReconnectPolicy};
pub use config::{ConfigError, SyncConfig};
pub use listeners::ListenerId;
pub use poller::WatchTarget;
pub use transport::{Connector, Credential, Transport, TransportError, WsConnector};
pub use tripsync_protocol as protocol;
pub use watch::{TripWatcher, WatchOptions};
