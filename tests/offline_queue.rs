use std::sync::Arc;
use std::time::Duration;

use edit_queue::capabilities::testing::{Outcome, RecordingStore, ScriptedTransport, StaticProbe};
use edit_queue::codec::SerializedRequest;
use edit_queue::edit::{EditImageRequest, EditType, ImagePart};
use edit_queue::{
    BackgroundWorker, ClientEvent, ClientMessage, ClientNotifier, GatewayReply, InterceptError,
    MemoryStore, MessageGateway, NetworkMonitor, NetworkStatus, QueueProcessor, QueueStatus,
    QueueStore, SqliteStore, WorkerConfig,
};

fn edit_url(name: &str) -> String {
    format!("https://api.example.com/edit-image?job={name}")
}

fn request(name: &str) -> SerializedRequest {
    SerializedRequest {
        method: "POST".into(),
        url: edit_url(name),
        headers: vec![("content-type".into(), "application/octet-stream".into())],
        body: Some(name.as_bytes().to_vec()),
    }
}

struct Harness {
    processor: Arc<QueueProcessor>,
    transport: Arc<ScriptedTransport>,
    notifier: ClientNotifier,
}

fn offline_processor(store: Arc<dyn QueueStore>) -> Harness {
    let notifier = ClientNotifier::new(64);
    let transport = Arc::new(ScriptedTransport::new());
    let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::Offline, notifier.clone()));
    let processor = Arc::new(
        QueueProcessor::new(
            WorkerConfig::default(),
            store,
            transport.clone(),
            notifier.clone(),
            monitor,
        )
        .unwrap(),
    );
    Harness {
        processor,
        transport,
        notifier,
    }
}

fn drain_events(events: &mut edit_queue::Subscription) -> Vec<ClientEvent> {
    std::iter::from_fn(|| events.try_recv()).collect()
}

#[tokio::test(start_paused = true)]
async fn failing_head_is_retried_before_later_requests() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    let mut events = h.notifier.subscribe();

    h.transport
        .script(&edit_url("a"), [Outcome::Status(500), Outcome::Status(503)]);
    for name in ["a", "b", "c"] {
        h.processor.enqueue(request(name), "connection refused").await;
    }
    assert_eq!(h.transport.dispatch_count(), 0);

    assert!(h.processor.handle_network_signal(NetworkStatus::Online).await);
    h.processor.wait_until_idle().await;

    assert_eq!(
        h.transport.dispatched(),
        vec![
            edit_url("a"),
            edit_url("a"),
            edit_url("a"),
            edit_url("b"),
            edit_url("c")
        ]
    );

    let successes: Vec<usize> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::AiRequestSuccess { queue_length, .. } => Some(queue_length),
            _ => None,
        })
        .collect();
    assert_eq!(successes, vec![2, 1, 0]);
}

#[tokio::test(start_paused = true)]
async fn request_is_dropped_after_max_retries() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    let mut events = h.notifier.subscribe();

    h.transport.script(
        &edit_url("a"),
        [Outcome::Status(500), Outcome::Status(500), Outcome::Status(500)],
    );
    let a = h.processor.enqueue(request("a"), "timeout").await;
    let b = h.processor.enqueue(request("b"), "timeout").await;

    h.processor.handle_network_signal(NetworkStatus::Online).await;
    h.processor.wait_until_idle().await;

    assert_eq!(h.transport.dispatch_count(), 4);
    let outcomes: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::AiRequestSuccess { .. } | ClientEvent::AiRequestFailed { .. }))
        .collect();
    match &outcomes[..] {
        [ClientEvent::AiRequestFailed {
            request_id,
            max_retries_exceeded: true,
            queue_length: 1,
            error,
        }, ClientEvent::AiRequestSuccess {
            request_id: second, ..
        }] => {
            assert_eq!(request_id, &a);
            assert!(error.contains("500"), "error was {error}");
            assert_eq!(second, &b);
        }
        other => panic!("unexpected outcomes: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn clear_removes_pending_requests() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    let gateway = MessageGateway::new(h.processor.clone());
    h.processor.enqueue(request("a"), "offline").await;
    h.processor.enqueue(request("b"), "offline").await;

    assert_eq!(
        gateway.handle(ClientMessage::ClearAiQueue).await,
        GatewayReply::Acknowledged
    );
    assert_eq!(
        gateway.handle(ClientMessage::GetQueueStatus).await,
        GatewayReply::QueueStatus(QueueStatus {
            queue_length: 0,
            is_processing: false
        })
    );

    h.processor.handle_network_signal(NetworkStatus::Online).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.dispatch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn queue_status_during_drain() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    let gateway = MessageGateway::new(h.processor.clone());
    for name in ["a", "b", "c"] {
        h.processor.enqueue(request(name), "offline").await;
    }

    h.processor.handle_network_signal(NetworkStatus::Online).await;
    // first request is in flight on the 10ms scripted latency
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(
        gateway.handle(ClientMessage::GetQueueStatus).await,
        GatewayReply::QueueStatus(QueueStatus {
            queue_length: 2,
            is_processing: true
        })
    );

    h.processor.wait_until_idle().await;
    assert_eq!(h.processor.queue_status().await, QueueStatus::default());
}

#[tokio::test(start_paused = true)]
async fn going_offline_mid_drain_stops_after_current_request() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    let gateway = MessageGateway::new(h.processor.clone());
    for name in ["a", "b", "c", "d"] {
        h.processor.enqueue(request(name), "offline").await;
    }

    h.processor.handle_network_signal(NetworkStatus::Online).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.transport.dispatch_count(), 1);

    h.processor.handle_network_signal(NetworkStatus::Offline).await;
    h.processor.wait_until_idle().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.transport.dispatched(), vec![edit_url("a")]);
    assert_eq!(
        gateway.handle(ClientMessage::GetQueueStatus).await,
        GatewayReply::QueueStatus(QueueStatus {
            queue_length: 3,
            is_processing: false
        })
    );
}

#[tokio::test(start_paused = true)]
async fn crash_mid_attempt_replays_in_flight_request_first() {
    let store = Arc::new(MemoryStore::new());
    let notifier = ClientNotifier::new(64);
    // long attempts leave a wide window to look at the store mid-dispatch
    let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_secs(5)));
    let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::Offline, notifier.clone()));
    let processor = Arc::new(
        QueueProcessor::new(
            WorkerConfig::default(),
            store.clone(),
            transport.clone(),
            notifier,
            monitor,
        )
        .unwrap(),
    );

    transport.script(&edit_url("a"), [Outcome::Status(503)]);
    let a = processor.enqueue(request("a"), "offline").await;
    let b = processor.enqueue(request("b"), "offline").await;
    processor.handle_network_signal(NetworkStatus::Online).await;

    // attempt 1: 0..5s, backoff 2s, pause 1s, attempt 2 from 8s
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.dispatch_count(), 2);
    assert_eq!(processor.queue_status().await.queue_length, 1);
    let snapshot = store.load().await.unwrap();

    // restart from what was on disk at that moment
    let restarted = offline_processor(Arc::new(MemoryStore::with_items(snapshot)));
    assert_eq!(restarted.processor.restore().await, 2);
    let pending = restarted.processor.pending().await;
    let order: Vec<_> = pending.iter().map(|q| q.id.clone()).collect();
    assert_eq!(order, vec![a, b]);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[1].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn never_more_than_one_request_in_flight() {
    let h = offline_processor(Arc::new(MemoryStore::new()));
    h.transport
        .script(&edit_url("0"), [Outcome::Status(502)]);
    h.processor.handle_network_signal(NetworkStatus::Online).await;

    let mut joins = Vec::new();
    for n in 0..8 {
        let processor = h.processor.clone();
        joins.push(tokio::spawn(async move {
            processor.enqueue(request(&n.to_string()), "timeout").await;
            processor.retry_failed_requests().await;
        }));
    }
    for join in joins {
        join.await.unwrap();
    }
    h.processor.wait_until_idle().await;

    assert_eq!(h.transport.dispatch_count(), 9);
    assert_eq!(h.transport.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_sent_while_offline() {
    let store = Arc::new(RecordingStore::new());
    let h = offline_processor(store.clone());
    let a = h.processor.enqueue(request("a"), "offline").await;
    let b = h.processor.enqueue(request("b"), "offline").await;

    assert!(!h.processor.retry_failed_requests().await);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.dispatch_count(), 0);
    assert_eq!(store.last_saved_ids(), vec![a, b]);

    // repeated online signals start a single drain
    assert!(h.processor.handle_network_signal(NetworkStatus::Online).await);
    assert!(!h.processor.handle_network_signal(NetworkStatus::Online).await);
    assert!(!h.processor.retry_failed_requests().await);
    h.processor.wait_until_idle().await;

    assert_eq!(h.transport.dispatch_count(), 2);
    assert!(store.last_saved_ids().is_empty());
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let first = {
        let h = offline_processor(Arc::new(SqliteStore::open(&path).unwrap()));
        let a = h.processor.enqueue(request("a"), "offline").await;
        let b = h.processor.enqueue(request("b"), "offline").await;
        vec![a, b]
    };

    let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(1)));
    let worker = BackgroundWorker::start(
        WorkerConfig {
            inter_request_delay_ms: 1,
            ..WorkerConfig::default()
        },
        Arc::new(SqliteStore::open(&path).unwrap()),
        transport.clone(),
        Arc::new(StaticProbe::new(NetworkStatus::Offline)),
    )
    .await
    .unwrap();

    let restored: Vec<_> = worker
        .processor()
        .pending()
        .await
        .into_iter()
        .map(|q| q.id)
        .collect();
    assert_eq!(restored, first);

    let mut events = worker.subscribe();
    worker.connectivity_changed(true).await;
    let mut delivered = Vec::new();
    while delivered.len() < 2 {
        if let Some(ClientEvent::AiRequestSuccess { request_id, .. }) = events.recv().await {
            delivered.push(request_id);
        }
    }
    assert_eq!(delivered, first);
    assert_eq!(transport.dispatched(), vec![edit_url("a"), edit_url("b")]);

    worker.processor().wait_until_idle().await;
    worker.shutdown().await;
    let reopened = SqliteStore::open(&path).unwrap();
    assert!(reopened.load().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_edit_is_queued_and_replayed() {
    let transport = Arc::new(ScriptedTransport::new());
    let worker = BackgroundWorker::start(
        WorkerConfig::default(),
        Arc::new(MemoryStore::new()),
        transport.clone(),
        Arc::new(StaticProbe::new(NetworkStatus::Offline)),
    )
    .await
    .unwrap();
    let mut events = worker.subscribe();

    let url = "http://localhost:8000/edit-image";
    transport.script(
        url,
        [Outcome::connection_refused(), Outcome::Image(b"edited".to_vec())],
    );

    let request = EditImageRequest::new(EditType::Enhance, ImagePart::png("photo.png", vec![7; 32]))
        .into_request(&worker.processor().config().api_base_url)
        .unwrap();
    let err = worker.interceptor().send(request).await.unwrap_err();
    let Some(queued) = err.queued_id().cloned() else {
        panic!("expected the failed edit to be queued: {err}");
    };
    assert!(matches!(err, InterceptError::Failed { .. }));

    match events.recv().await {
        Some(ClientEvent::AiRequestQueued {
            request_id,
            queue_length,
            ..
        }) => {
            assert_eq!(request_id, queued);
            assert_eq!(queue_length, 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let replayed_body = worker.processor().pending().await[0]
        .request_data
        .body
        .clone()
        .unwrap();
    assert!(replayed_body.windows(7).any(|w| w == b"enhance"));

    worker.connectivity_changed(true).await;
    loop {
        match events.recv().await {
            Some(ClientEvent::AiRequestSuccess {
                request_id,
                image_blob,
                queue_length,
            }) => {
                assert_eq!(request_id, queued);
                assert_eq!(queue_length, 0);
                assert_eq!(image_blob.map(|b| b.bytes), Some(b"edited".to_vec()));
                break;
            }
            Some(_) => {}
            None => panic!("event stream closed"),
        }
    }
    assert_eq!(transport.dispatch_count(), 2);
    worker.shutdown().await;
}
