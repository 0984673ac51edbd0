//! In-memory fakes shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tripsync_protocol::{ClientMessage, EntityKey, EntityUpdate, TripRecord, decode_client_message};

use crate::api::{ApiError, TripSource};
use crate::client::ReconnectPolicy;
use crate::transport::{Connector, Credential, Transport, TransportError};

/// Reconnect policy with millisecond delays and no jitter.
#[must_use]
pub fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_jitter: Duration::ZERO,
    }
}

/// Poll `cond` every 5ms, panicking after 2s.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// FAKE REALTIME BACKEND
// =============================================================================

#[derive(Default)]
struct BackendState {
    fail_next: u32,
    fail_always: bool,
    attempts: usize,
    handshakes: usize,
    credentials: Vec<String>,
    sent: Vec<ClientMessage>,
    live: Option<mpsc::UnboundedSender<String>>,
}

/// Scriptable server side of the realtime channel. Implements [`Connector`].
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    #[must_use]
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Reject the next `n` handshakes.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn fail_always(&self, fail: bool) {
        self.lock().fail_always = fail;
    }

    /// Connection attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Successful handshakes.
    #[must_use]
    pub fn handshakes(&self) -> usize {
        self.lock().handshakes
    }

    #[must_use]
    pub fn credentials(&self) -> Vec<String> {
        self.lock().credentials.clone()
    }

    /// Every message the client has sent, across all connections.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.lock().sent.clone()
    }

    #[must_use]
    pub fn joins(&self, key: &str) -> usize {
        self.sent().iter().filter(|m| **m == ClientMessage::join(key.into())).count()
    }

    #[must_use]
    pub fn leaves(&self, key: &str) -> usize {
        self.sent().iter().filter(|m| **m == ClientMessage::leave(key.into())).count()
    }

    /// Push an update to the live connection. Returns false when none is live.
    pub fn push(&self, update: &EntityUpdate) -> bool {
        self.push_text(update.to_event_json().unwrap())
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.lock().live.as_ref().is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Close the live connection from the server side.
    pub fn drop_connection(&self) {
        self.lock().live = None;
    }
}

#[async_trait]
impl Connector for FakeBackend {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.lock();
        state.attempts += 1;
        state.credentials.push(credential.token().to_owned());
        if state.fail_always {
            return Err(TransportError::Rejected { status: 503 });
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Rejected { status: 503 });
        }
        state.handshakes += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.live = Some(tx);
        Ok(Box::new(FakeTransport { backend: self.clone(), inbound: rx }))
    }
}

struct FakeTransport {
    backend: FakeBackend,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let message = decode_client_message(&text).map_err(|_| TransportError::Closed)?;
        self.backend.lock().sent.push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

// =============================================================================
// FAKE TRIP SOURCE
// =============================================================================

/// In-memory canonical trip state. Implements [`TripSource`].
#[derive(Default)]
pub struct FakeSource {
    trips: Mutex<BTreeMap<EntityKey, TripRecord>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl FakeSource {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn with(records: impl IntoIterator<Item = TripRecord>) -> Arc<Self> {
        let source = Self::new();
        for record in records {
            source.put(record);
        }
        source
    }

    pub fn put(&self, record: TripRecord) {
        self.trips.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn remove(&self, key: &str) {
        self.trips.lock().unwrap().remove(&EntityKey::from(key));
    }

    pub fn set_status(&self, key: &str, status: &str) {
        if let Some(record) = self.trips.lock().unwrap().get_mut(&EntityKey::from(key)) {
            status.clone_into(&mut record.status);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status { status: 503, message: "unavailable".to_owned() });
        }
        Ok(())
    }
}

#[async_trait]
impl TripSource for FakeSource {
    async fn fetch_trip(&self, id: &EntityKey) -> Result<TripRecord, ApiError> {
        self.check()?;
        self.trips
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::Status { status: 404, message: "Trip not found".to_owned() })
    }

    async fn fetch_trips(&self) -> Result<Vec<TripRecord>, ApiError> {
        self.check()?;
        Ok(self.trips.lock().unwrap().values().cloned().collect())
    }
}
