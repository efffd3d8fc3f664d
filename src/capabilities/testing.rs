//! Fakes for the worker's outside edges: transport, connectivity probe and
//! store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::http::{HttpError, HttpHeaders, HttpResponse, Transport};
use crate::event::RequestId;
use crate::model::QueuedRequest;
use crate::network::{ConnectivityProbe, NetworkStatus};
use crate::store::{MemoryStore, QueueStore, StoreError};

/// What a scripted exchange produces.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Empty body with this status.
    Status(u16),
    /// 200 with a raw `image/png` body.
    Image(Vec<u8>),
    /// 200 with a JSON body.
    Json(serde_json::Value),
    /// 200 labelled `application/json`, body sent as-is.
    RawJson(Vec<u8>),
    Fail(HttpError),
}

impl Outcome {
    fn into_result(self) -> Result<HttpResponse, HttpError> {
        let with_type = |content_type: &str, body: Vec<u8>| {
            let mut headers = HttpHeaders::new();
            headers.insert("content-type", content_type);
            HttpResponse::new(200, headers, body, 1)
        };
        match self {
            Outcome::Status(status) => Ok(HttpResponse::new(status, HttpHeaders::new(), Vec::new(), 1)),
            Outcome::Image(bytes) => Ok(with_type("image/png", bytes)),
            Outcome::Json(value) => Ok(with_type("application/json", value.to_string().into_bytes())),
            Outcome::RawJson(bytes) => Ok(with_type("application/json", bytes)),
            Outcome::Fail(error) => Err(error),
        }
    }

    pub fn connection_refused() -> Self {
        Outcome::Fail(HttpError::ConnectionError {
            host: "api.example.com".into(),
            message: "connection refused".into(),
        })
    }
}

/// Transport answering from per-URL scripts. Unscripted calls succeed with a
/// small PNG body. Every call is logged, and overlapping calls are counted so
/// tests can check the at-most-one-in-flight rule.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(10))
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency,
        }
    }

    /// Queues outcomes for `url`, consumed one per call.
    pub fn script(&self, url: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// URLs in dispatch order.
    pub fn dispatched(&self) -> Vec<String> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: reqwest::Request) -> Result<HttpResponse, HttpError> {
        let url = request.url().to_string();
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&url)
            .and_then(VecDeque::pop_front);
        scripted
            .unwrap_or_else(|| Outcome::Image(b"\x89PNG".to_vec()))
            .into_result()
    }
}

/// Probe returning whatever the test last set.
pub struct StaticProbe {
    status: Mutex<NetworkStatus>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: Mutex::new(status),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, status: NetworkStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> NetworkStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory store that keeps the id list of every save and can be told to
/// fail.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    history: Mutex<Vec<Vec<RequestId>>>,
    failing: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<QueuedRequest>) -> Self {
        Self {
            inner: MemoryStore::with_items(items),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saves(&self) -> Vec<Vec<RequestId>> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_saved_ids(&self) -> Vec<RequestId> {
        self.saves().pop().unwrap_or_default()
    }
}

#[async_trait]
impl QueueStore for RecordingStore {
    async fn save(&self, queue: &[QueuedRequest]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            )));
        }
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(queue.iter().map(|q| q.id.clone()).collect());
        self.inner.save(queue).await
    }

    async fn load(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupted {
                reason: "simulated failure",
            });
        }
        self.inner.load().await
    }
}
