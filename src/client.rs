//! Realtime sync client: one live connection, many room subscriptions.
//!
//! DESIGN
//! ======
//! `RealtimeSyncClient` is a cheap `Clone` handle around shared state. A
//! background session task owns the transport and runs a `select!` loop over
//! outbound room messages, inbound server events, and cancellation.
//!
//! The desired-subscription set ([`RoomSet`]) is the source of truth. Every
//! successful handshake replays one `join_room` per desired key, and the
//! replay happens under the same lock that installs the outbound channel, so
//! a concurrent `subscribe` either lands in the replay or sends its own join,
//! never both and never neither.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` → spawn session task; while one is running, swap in the new
//!    credential and restore its failure budget instead
//! 2. handshake ok → status `Connected`, replay joins
//! 3. transport drop → status `Disconnected`, backoff, go to 2
//! 4. `max_attempts` consecutive failures → task exits, caller must `connect` again
//! 5. `disconnect` → cancel task, clear desired set
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error to the caller. Handshake, send and decode
//! failures are logged and absorbed; consumers rely on their reconciliation
//! poller for correctness, not on stream health.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tripsync_protocol::{ClientMessage, EntityKey, EntityUpdate, ServerEvent, decode_server_event, encode_client_message};
use uuid::Uuid;

use crate::listeners::{ListenerId, ListenerRegistry, ListenerScope};
use crate::rooms::{RoomChange, RoomSet};
use crate::transport::{Connector, Credential, Transport, WsConnector};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_MAX_JITTER_MS: u64 = 250;

/// Realtime connection status, suitable for a "live updates" indicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect backoff: exponential from `base_delay`, capped at `max_delay`,
/// plus up to `max_jitter` of random spread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_jitter: Duration::from_millis(DEFAULT_MAX_JITTER_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (1-based), jitter excluded.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << shift).min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let spread = if jitter_ms == 0 { 0 } else { rand::rng().random_range(0..=jitter_ms) };
        self.backoff(attempt) + Duration::from_millis(spread)
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct SessionState {
    rooms: RoomSet,
    /// Bumped on every `connect` that starts a task and on `disconnect`.
    generation: u64,
    /// Cancellation handle of the running session task, if any.
    session: Option<CancellationToken>,
    /// Credential for the next handshake; the retry loop reads it per attempt.
    credential: Option<Credential>,
    /// Set by a `connect` that found a session running.
    retry_requested: bool,
    /// Present only while a transport is live.
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: Mutex<SessionState>,
    listeners: Mutex<ListenerRegistry>,
    status_tx: watch::Sender<ConnectionStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn handle_inbound(&self, session_id: Uuid, text: &str) {
        match decode_server_event(text) {
            Ok(ServerEvent::EntityUpdated(update)) => {
                debug!(%session_id, entity_id = %update.entity_id, status = ?update.status, "realtime: update");
                self.dispatch(&update);
            }
            Ok(ServerEvent::RoomJoined { entity_id }) => debug!(%session_id, %entity_id, "realtime: room joined"),
            Ok(ServerEvent::RoomLeft { entity_id }) => debug!(%session_id, %entity_id, "realtime: room left"),
            Ok(ServerEvent::Unknown { kind }) => debug!(%session_id, %kind, "realtime: ignoring event"),
            Err(error) => warn!(%session_id, %error, "realtime: invalid inbound message"),
        }
    }

    fn dispatch(&self, update: &EntityUpdate) {
        // Callbacks may re-enter the client (e.g. unsubscribe), so never call them under the lock.
        let callbacks = lock(&self.listeners).matching(&update.entity_id);
        for callback in callbacks {
            callback(update);
        }
    }
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Shared handle to the session's realtime connection. Clone to share.
#[derive(Clone)]
pub struct RealtimeSyncClient {
    inner: Arc<Inner>,
}

impl RealtimeSyncClient {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state: Mutex::new(SessionState {
                    rooms: RoomSet::new(),
                    generation: 0,
                    session: None,
                    credential: None,
                    retry_requested: false,
                    outbound: None,
                }),
                listeners: Mutex::new(ListenerRegistry::new()),
                status_tx,
            }),
        }
    }

    /// Client over a WebSocket endpoint.
    #[must_use]
    pub fn websocket(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(WsConnector::new(url)), policy)
    }

    /// Start the session. While a session is already running, the new
    /// credential replaces the old one for the next handshake and the
    /// session's failure budget is restored.
    ///
    /// Must be called from within a tokio runtime; outside one the call is
    /// logged and ignored.
    pub fn connect(&self, credential: Credential) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("realtime: connect called outside a tokio runtime");
            return;
        };

        let mut state = lock(&self.inner.state);
        state.credential = Some(credential);
        if state.session.is_some() {
            state.retry_requested = true;
            debug!(generation = state.generation, "realtime: session active, credential refreshed");
            return;
        }
        state.generation += 1;
        state.retry_requested = false;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.session = Some(cancel.clone());
        self.inner.set_status(ConnectionStatus::Connecting);
        drop(state);

        info!(generation, "realtime: session starting");
        runtime.spawn(session_loop(Arc::clone(&self.inner), generation, cancel));
    }

    /// Tear down the transport and forget every desired subscription.
    pub fn disconnect(&self) {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        state.rooms.clear();
        state.outbound = None;
        state.credential = None;
        state.retry_requested = false;
        if let Some(cancel) = state.session.take() {
            cancel.cancel();
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
        info!(generation = state.generation, "realtime: disconnected by caller");
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Receiver that observes every status transition.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Add a holder for `key`. Joins the room on the first holder, now if
    /// connected, otherwise on the next successful handshake.
    pub fn subscribe(&self, key: impl Into<EntityKey>) {
        let key = key.into();
        let mut state = lock(&self.inner.state);
        match state.rooms.acquire(&key) {
            RoomChange::Joined => match &state.outbound {
                Some(tx) => {
                    if tx.send(ClientMessage::join(key.clone())).is_err() {
                        warn!(entity_id = %key, "realtime: join not queued, session ending");
                    } else {
                        debug!(entity_id = %key, "realtime: join queued");
                    }
                }
                None => debug!(entity_id = %key, "realtime: join deferred until connected"),
            },
            _ => debug!(entity_id = %key, holders = state.rooms.holders(&key), "realtime: already subscribed"),
        }
    }

    /// Drop a holder for `key`. Leaves the room when the last holder goes.
    pub fn unsubscribe(&self, key: impl Into<EntityKey>) {
        let key = key.into();
        let mut state = lock(&self.inner.state);
        match state.rooms.release(&key) {
            RoomChange::Left => {
                if let Some(tx) = &state.outbound {
                    if tx.send(ClientMessage::leave(key.clone())).is_err() {
                        debug!(entity_id = %key, "realtime: leave not queued, session ending");
                    }
                }
            }
            RoomChange::Unknown => warn!(entity_id = %key, "realtime: unsubscribe without subscribe"),
            RoomChange::Joined | RoomChange::Unchanged => {}
        }
    }

    /// Whether any holder still wants `key`.
    #[must_use]
    pub fn is_subscribed(&self, key: &EntityKey) -> bool {
        lock(&self.inner.state).rooms.contains(key)
    }

    /// Snapshot of the desired-subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<EntityKey> {
        lock(&self.inner.state).rooms.keys().cloned().collect()
    }

    /// Listen to every inbound update.
    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&EntityUpdate) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).register(ListenerScope::Broadcast, Arc::new(callback))
    }

    /// Listen to updates for one entity only.
    pub fn on_entity_update<F>(&self, key: impl Into<EntityKey>, callback: F) -> ListenerId
    where
        F: Fn(&EntityUpdate) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).register(ListenerScope::Entity(key.into()), Arc::new(callback))
    }

    /// Remove a listener registered with either `on_update` or `on_entity_update`.
    pub fn off_update(&self, id: ListenerId) -> bool {
        lock(&self.inner.listeners).remove(id)
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

async fn session_loop(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        let credential = {
            let state = lock(&inner.state);
            match &state.credential {
                Some(credential) if state.generation == generation => credential.clone(),
                _ => return,
            }
        };
        let attempt = tokio::select! {
            () = cancel.cancelled() => return,
            result = inner.connector.connect(&credential) => result,
        };

        match attempt {
            Ok(transport) => {
                failures = 0;
                lock(&inner.state).retry_requested = false;
                run_transport(&inner, transport, generation, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
            Err(error) => warn!(generation, %error, "realtime: handshake failed"),
        }

        failures += 1;
        if failures > inner.policy.max_attempts {
            // Decided under the lock so a concurrent `connect` either resets
            // the budget here or finds the session gone and starts a new one.
            let mut state = lock(&inner.state);
            if state.generation != generation {
                return;
            }
            if std::mem::take(&mut state.retry_requested) {
                info!(generation, "realtime: connect requested while retrying, budget restored");
                failures = 1;
            } else {
                warn!(generation, attempts = failures, "realtime: giving up until next connect");
                state.session = None;
                state.outbound = None;
                inner.set_status(ConnectionStatus::Disconnected);
                return;
            }
        }

        let delay = inner.policy.delay_with_jitter(failures);
        info!(generation, attempt = failures, delay_ms = delay.as_millis(), "realtime: reconnecting");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        if lock(&inner.state).generation == generation {
            inner.set_status(ConnectionStatus::Connecting);
        }
    }
}

/// Drive one live transport until it drops or the session is cancelled.
async fn run_transport(inner: &Inner, mut transport: Box<dyn Transport>, generation: u64, cancel: &CancellationToken) {
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

    let replayed = {
        let mut state = lock(&inner.state);
        if state.generation == generation {
            for key in state.rooms.keys() {
                let _ = tx.send(ClientMessage::join(key.clone()));
            }
            state.outbound = Some(tx);
            inner.set_status(ConnectionStatus::Connected);
            Some(state.rooms.len())
        } else {
            None
        }
    };
    let Some(replayed) = replayed else {
        transport.close().await;
        return;
    };
    info!(%session_id, generation, rooms = replayed, "realtime: connected");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                transport.close().await;
                break;
            }
            Some(message) = rx.recv() => {
                let text = match encode_client_message(&message) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%session_id, %error, "realtime: encode failed");
                        continue;
                    }
                };
                debug!(%session_id, entity_id = %message.entity_id(), ?message, "realtime: send");
                if let Err(error) = transport.send(text).await {
                    warn!(%session_id, %error, "realtime: send failed");
                    break;
                }
            }
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => inner.handle_inbound(session_id, &text),
                Some(Err(error)) => {
                    warn!(%session_id, %error, "realtime: receive failed");
                    break;
                }
                None => {
                    info!(%session_id, "realtime: closed by server");
                    break;
                }
            },
        }
    }

    let mut state = lock(&inner.state);
    if state.generation == generation {
        state.outbound = None;
        inner.set_status(ConnectionStatus::Disconnected);
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
