//! The queue state machine.
//!
//! ```text
//!   Idle ──trigger (online, queue non-empty)──▶ Draining
//!   Draining ──queue empty or offline──▶ Idle
//! ```
//!
//! A drain handles one request at a time: pop the head, dispatch, then on
//! failure re-queue it at the front after a backoff. Every structural change
//! is written to the store before the next suspension point that depends on
//! it. The in-flight request is part of every snapshot until its outcome is
//! recorded, so a crash mid-attempt replays it on the next start.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CachedResponse, ResponseCache};
use crate::capabilities::http::{HttpError, HttpResponse, Transport};
use crate::codec::{self, SerializedRequest};
use crate::config::{ConfigError, WorkerConfig};
use crate::event::{ClientEvent, RequestId};
use crate::model::{QueueStatus, QueuedRequest};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::notifier::ClientNotifier;
use crate::payload;
use crate::store::QueueStore;
use crate::QueueError;

const CACHE_KEY_PREFIX: &str = "ai-response";

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueuedRequest>,
    in_flight: Option<QueuedRequest>,
}

impl QueueState {
    fn snapshot(&self) -> Vec<QueuedRequest> {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .cloned()
            .collect()
    }
}

pub struct QueueProcessor {
    config: WorkerConfig,
    state: Mutex<QueueState>,
    processing: watch::Sender<bool>,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    notifier: ClientNotifier,
    monitor: Arc<NetworkMonitor>,
    cache: ResponseCache,
}

impl QueueProcessor {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        notifier: ClientNotifier,
        monitor: Arc<NetworkMonitor>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let cache = ResponseCache::new(config.cache_capacity, config.max_cached_body_bytes)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let (processing, _) = watch::channel(false);

        Ok(Self {
            config,
            state: Mutex::new(QueueState::default()),
            processing,
            store,
            transport,
            notifier,
            monitor,
            cache,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.current()
    }

    pub fn is_processing(&self) -> bool {
        *self.processing.borrow()
    }

    /// Loads the persisted queue. Items already enqueued in this process
    /// stay behind the restored ones. A store failure starts empty.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> usize {
        let restored = match self.store.load().await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to load persisted queue, starting empty");
                return 0;
            }
        };

        let count = restored.len();
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.queue);
        state.queue = restored.into_iter().chain(pending).collect();
        info!(restored = count, queue_length = state.queue.len(), "queue restored");
        count
    }

    #[instrument(skip(self, request_data, error), fields(request_id))]
    pub async fn enqueue(
        self: &Arc<Self>,
        request_data: SerializedRequest,
        error: impl Into<String>,
    ) -> RequestId {
        let item = QueuedRequest::new(request_data);
        let request_id = item.id.clone();
        tracing::Span::current().record("request_id", request_id.as_str());

        let queue_length = {
            let mut state = self.state.lock().await;
            state.queue.push_back(item);
            self.persist(&state).await;
            state.queue.len()
        };

        info!(queue_length, "request queued");
        self.notifier.broadcast(ClientEvent::AiRequestQueued {
            request_id: request_id.clone(),
            queue_length,
            error: error.into(),
        });

        self.trigger_drain().await;
        request_id
    }

    /// Starts a drain unless offline, empty or already draining.
    pub async fn trigger_drain(self: &Arc<Self>) -> bool {
        if !self.monitor.is_online() {
            debug!("offline, drain deferred");
            return false;
        }

        {
            let state = self.state.lock().await;
            if state.queue.is_empty() {
                return false;
            }
            let started = self.processing.send_if_modified(|processing| {
                if *processing {
                    false
                } else {
                    *processing = true;
                    true
                }
            });
            if !started {
                debug!("drain already running");
                return false;
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain().await });
        true
    }

    pub async fn retry_failed_requests(self: &Arc<Self>) -> bool {
        self.trigger_drain().await
    }

    /// Feeds a connectivity signal through the monitor. A transition to
    /// online starts a drain.
    pub async fn handle_network_signal(self: &Arc<Self>, status: NetworkStatus) -> bool {
        let changed = self.monitor.update(status);
        if changed && status.is_online() {
            self.trigger_drain().await;
        }
        changed
    }

    /// Drops every pending request. The one in flight, if any, finishes.
    #[instrument(skip(self))]
    pub async fn clear_queue(&self) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.queue.len();
            state.queue.clear();
            self.persist(&state).await;
            removed
        };

        info!(removed, "queue cleared");
        self.notifier
            .broadcast(ClientEvent::AiRequestQueueCleared { queue_length: 0 });
        removed
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            queue_length: state.queue.len(),
            is_processing: self.is_processing(),
        }
    }

    /// Pending requests in dispatch order. The in-flight one is not included.
    pub async fn pending(&self) -> Vec<QueuedRequest> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn wait_until_idle(&self) {
        let mut rx = self.processing.subscribe();
        let _ = rx.wait_for(|processing| !*processing).await;
    }

    async fn drain(self: Arc<Self>) {
        info!("drain started");
        loop {
            let item = {
                let mut state = self.state.lock().await;
                let next = if self.monitor.is_online() {
                    state.queue.pop_front()
                } else {
                    None
                };
                let Some(item) = next else {
                    state.in_flight = None;
                    self.processing.send_replace(false);
                    break;
                };
                state.in_flight = Some(item.clone());
                self.persist(&state).await;
                item
            };

            self.process_one(item).await;
            tokio::time::sleep(self.config.inter_request_delay()).await;
        }
        info!("drain finished");
    }

    #[instrument(skip(self, item), fields(request_id = %item.id, retry_count = item.retry_count))]
    async fn process_one(&self, item: QueuedRequest) {
        let request = match codec::deserialize(&item.request_data) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "stored request cannot be rebuilt, dropping");
                self.finish_permanent(&item, e.to_string(), false).await;
                return;
            }
        };

        let outcome = match self.transport.execute(request).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(HttpError::status(&response)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(response) => self.finish_success(&item, &response).await,
            Err(e) => self.handle_failure(item, &e).await,
        }
    }

    async fn finish_success(&self, item: &QueuedRequest, response: &HttpResponse) {
        let image_blob = match payload::decode_success(response) {
            Ok(blob) => blob,
            Err(e) => {
                error!(error = %e, "response payload cannot be decoded, dropping");
                self.finish_permanent(item, e.to_string(), false).await;
                return;
            }
        };

        let queue_length = {
            let mut state = self.state.lock().await;
            state.in_flight = None;
            self.persist(&state).await;
            state.queue.len()
        };

        info!(
            queue_length,
            status = response.status(),
            duration_ms = response.duration_ms(),
            "request delivered"
        );
        self.notifier.broadcast(ClientEvent::AiRequestSuccess {
            request_id: item.id.clone(),
            queue_length,
            image_blob,
        });

        let key = ResponseCache::generate_key(CACHE_KEY_PREFIX);
        if let Err(e) = self.cache.put(key, CachedResponse::from_response(response)) {
            warn!(error = %e, "response not cached");
        }
    }

    async fn handle_failure(&self, mut item: QueuedRequest, error: &HttpError) {
        item.retry_count += 1;

        if item.retry_count < self.config.max_retries {
            let delay = self.config.backoff_delay(item.retry_count);
            warn!(
                error = %error,
                retry_count = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, re-queued at front"
            );
            {
                let mut state = self.state.lock().await;
                state.in_flight = None;
                state.queue.push_front(item);
                self.persist(&state).await;
            }
            tokio::time::sleep(delay).await;
        } else {
            error!(
                error = %error,
                retry_count = item.retry_count,
                "max retries exceeded, dropping"
            );
            self.finish_permanent(&item, error.to_string(), true).await;
        }
    }

    async fn finish_permanent(
        &self,
        item: &QueuedRequest,
        error: String,
        max_retries_exceeded: bool,
    ) {
        let queue_length = {
            let mut state = self.state.lock().await;
            state.in_flight = None;
            self.persist(&state).await;
            state.queue.len()
        };

        self.notifier.broadcast(ClientEvent::AiRequestFailed {
            request_id: item.id.clone(),
            error,
            max_retries_exceeded,
            queue_length,
        });
    }

    async fn persist(&self, state: &QueueState) {
        if let Err(e) = self.store.save(&state.snapshot()).await {
            error!(error = %e, "failed to persist queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{Outcome, RecordingStore, ScriptedTransport};
    use crate::store::MemoryStore;
    use std::time::Duration;

    const URL: &str = "https://api.example.com/edit-image";

    fn request(url: &str) -> SerializedRequest {
        SerializedRequest {
            method: "POST".into(),
            url: url.into(),
            headers: vec![("content-type".into(), "application/octet-stream".into())],
            body: Some(vec![1, 2, 3]),
        }
    }

    struct Harness {
        processor: Arc<QueueProcessor>,
        transport: Arc<ScriptedTransport>,
        store: Arc<RecordingStore>,
        notifier: ClientNotifier,
    }

    fn harness(initial: NetworkStatus) -> Harness {
        let notifier = ClientNotifier::new(64);
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(RecordingStore::new());
        let monitor = Arc::new(NetworkMonitor::new(initial, notifier.clone()));
        let processor = Arc::new(
            QueueProcessor::new(
                WorkerConfig::default(),
                store.clone(),
                transport.clone(),
                notifier.clone(),
                monitor,
            )
            .unwrap(),
        );
        Harness {
            processor,
            transport,
            store,
            notifier,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offline_enqueue_persists_without_dispatch() {
        let h = harness(NetworkStatus::Offline);
        let mut events = h.notifier.subscribe();

        let id = h.processor.enqueue(request(URL), "connection refused").await;

        assert_eq!(
            events.try_recv(),
            Some(ClientEvent::AiRequestQueued {
                request_id: id.clone(),
                queue_length: 1,
                error: "connection refused".into(),
            })
        );
        assert_eq!(h.transport.dispatch_count(), 0);
        assert!(!h.processor.is_processing());
        assert_eq!(h.store.last_saved_ids(), vec![id]);
        assert!(!h.processor.retry_failed_requests().await);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_item_stays_persisted_until_outcome() {
        let h = harness(NetworkStatus::Online);
        let id = h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        let saves = h.store.saves();
        // push, pop-to-in-flight, success
        assert_eq!(saves, vec![vec![id.clone()], vec![id], vec![]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_requeues_at_front_after_backoff() {
        let h = harness(NetworkStatus::Online);
        h.transport
            .script(URL, [Outcome::Status(503), Outcome::Image(b"ok".to_vec())]);

        let started = tokio::time::Instant::now();
        let id = h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        // backoff for retry 1 plus two inter-request delays
        assert!(started.elapsed() >= Duration::from_millis(2000 + 2 * 1000));
        assert_eq!(h.transport.dispatch_count(), 2);

        let saves = h.store.saves();
        assert!(saves.iter().all(|ids| ids.len() <= 1));
        assert_eq!(saves.last(), Some(&vec![]));
        assert!(saves.contains(&vec![id]));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_request_is_dropped_without_retry() {
        let h = harness(NetworkStatus::Online);
        let mut events = h.notifier.subscribe();

        let mut bad = request(URL);
        bad.method = "BREW".into();
        let id = h.processor.enqueue(bad, "timeout").await;
        h.processor.wait_until_idle().await;

        let _queued = events.try_recv();
        match events.try_recv() {
            Some(ClientEvent::AiRequestFailed {
                request_id,
                max_retries_exceeded,
                queue_length,
                ..
            }) => {
                assert_eq!(request_id, id);
                assert!(!max_retries_exceeded);
                assert_eq!(queue_length, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.transport.dispatch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_success_payload_is_permanent() {
        let h = harness(NetworkStatus::Online);
        let mut events = h.notifier.subscribe();
        h.transport.script(URL, [Outcome::RawJson(b"{oops".to_vec())]);

        h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        let _queued = events.try_recv();
        assert!(matches!(
            events.try_recv(),
            Some(ClientEvent::AiRequestFailed {
                max_retries_exceeded: false,
                ..
            })
        ));
        assert_eq!(h.transport.dispatch_count(), 1);
        assert!(h.processor.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inline_json_image_reaches_success_event() {
        let h = harness(NetworkStatus::Online);
        let mut events = h.notifier.subscribe();
        h.transport.script(
            URL,
            [Outcome::Json(serde_json::json!({
                "status": "ok",
                "image": "data:image/jpeg;base64,/9j/4A==",
            }))],
        );

        let id = h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        let _queued = events.try_recv();
        match events.try_recv() {
            Some(ClientEvent::AiRequestSuccess {
                request_id,
                image_blob: Some(blob),
                ..
            }) => {
                assert_eq!(request_id, id);
                assert_eq!(blob.mime_type, "image/jpeg");
                assert_eq!(blob.bytes, vec![0xff, 0xd8, 0xff, 0xe0]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_response_is_cached() {
        let h = harness(NetworkStatus::Online);
        h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        assert_eq!(h.processor.cache().len(), 1);
        let key = h.processor.cache().keys().remove(0);
        assert!(key.starts_with("ai-response-"));
        assert_eq!(
            h.processor.cache().get(&key).map(|c| c.status),
            Some(200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_do_not_stop_processing() {
        let h = harness(NetworkStatus::Online);
        h.store.set_failing(true);

        h.processor.enqueue(request(URL), "timeout").await;
        h.processor.wait_until_idle().await;

        assert_eq!(h.transport.dispatch_count(), 1);
        assert_eq!(h.processor.queue_status().await.queue_length, 0);
    }

    #[tokio::test]
    async fn restore_puts_persisted_items_first() {
        let persisted = QueuedRequest::new(request("https://api.example.com/edit-image?n=1"));
        let store = Arc::new(MemoryStore::with_items(vec![persisted.clone()]));
        let notifier = ClientNotifier::new(8);
        let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::Offline, notifier.clone()));
        let processor = Arc::new(
            QueueProcessor::new(
                WorkerConfig::default(),
                store,
                Arc::new(ScriptedTransport::new()),
                notifier,
                monitor,
            )
            .unwrap(),
        );

        let fresh = processor.enqueue(request(URL), "offline").await;
        assert_eq!(processor.restore().await, 1);

        let ids: Vec<_> = processor.pending().await.into_iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![persisted.id, fresh]);
    }

    #[tokio::test]
    async fn clear_empties_queue_and_store() {
        let h = harness(NetworkStatus::Offline);
        h.processor.enqueue(request(URL), "a").await;
        h.processor.enqueue(request(URL), "b").await;
        let mut events = h.notifier.subscribe();

        assert_eq!(h.processor.clear_queue().await, 2);

        assert_eq!(
            events.try_recv(),
            Some(ClientEvent::AiRequestQueueCleared { queue_length: 0 })
        );
        assert_eq!(h.processor.queue_status().await.queue_length, 0);
        assert!(h.store.last_saved_ids().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let notifier = ClientNotifier::new(8);
        let result = QueueProcessor::new(
            WorkerConfig {
                max_retries: 0,
                ..WorkerConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedTransport::new()),
            notifier.clone(),
            Arc::new(NetworkMonitor::new(NetworkStatus::Offline, notifier)),
        );
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
