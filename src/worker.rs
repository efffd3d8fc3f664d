//! Process-wide wiring: one processor, one gateway and one connectivity loop
//! sharing a notifier.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::Transport;
use crate::config::WorkerConfig;
use crate::gateway::{self, GatewayHandle, MessageGateway};
use crate::interceptor::{EditInterceptor, InterceptRule};
use crate::network::{ConnectivityProbe, NetworkMonitor, NetworkStatus};
use crate::notifier::{ClientNotifier, Subscription};
use crate::processor::QueueProcessor;
use crate::store::QueueStore;
use crate::QueueError;

const GATEWAY_CAPACITY: usize = 32;
const SIGNAL_CAPACITY: usize = 16;

pub struct BackgroundWorker {
    processor: Arc<QueueProcessor>,
    notifier: ClientNotifier,
    gateway: GatewayHandle,
    interceptor: Arc<EditInterceptor>,
    signals: mpsc::Sender<NetworkStatus>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Restores the persisted queue, then starts the gateway and the
    /// connectivity loop. A restored queue drains at once when starting
    /// online, otherwise as soon as the immediate first probe answers.
    #[instrument(skip_all)]
    pub async fn start(
        config: WorkerConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let notifier = ClientNotifier::new(config.broadcast_capacity);
        let monitor = Arc::new(NetworkMonitor::new(
            config.initial_network_status,
            notifier.clone(),
        ));
        let processor = Arc::new(QueueProcessor::new(
            config.clone(),
            store,
            Arc::clone(&transport),
            notifier.clone(),
            monitor,
        )?);
        let restored = processor.restore().await;
        // no status transition will come if we already start online
        processor.trigger_drain().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (gateway, gateway_task) =
            MessageGateway::new(Arc::clone(&processor)).spawn(GATEWAY_CAPACITY, shutdown_rx.clone());

        let (signals, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let monitor_task = tokio::spawn(connectivity_loop(
            Arc::clone(&processor),
            probe,
            config.probe_interval(),
            signal_rx,
            shutdown_rx,
        ));

        let interceptor = Arc::new(EditInterceptor::new(
            transport,
            Arc::clone(&processor),
            notifier.clone(),
            InterceptRule::new(reqwest::Method::POST, config.intercept_path.clone()),
            config.caller_timeout(),
        ));

        info!(restored, api = %config.api_base_url, "worker started");
        Ok(Self {
            processor,
            notifier,
            gateway,
            interceptor,
            signals,
            shutdown,
            tasks: vec![gateway_task, monitor_task],
        })
    }

    pub fn gateway(&self) -> GatewayHandle {
        self.gateway.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn interceptor(&self) -> Arc<EditInterceptor> {
        Arc::clone(&self.interceptor)
    }

    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    /// Platform connectivity event. Treated like a probe result.
    pub async fn connectivity_changed(&self, online: bool) {
        let status = NetworkStatus::from_online(online);
        if self.signals.send(status).await.is_err() {
            warn!(%status, "connectivity loop is gone, signal dropped");
        }
    }

    /// Stops the gateway and the connectivity loop. A drain already running
    /// finishes its current attempt on the runtime.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker stopped");
    }
}

async fn connectivity_loop(
    processor: Arc<QueueProcessor>,
    probe: Arc<dyn ConnectivityProbe>,
    every: Duration,
    mut signals: mpsc::Receiver<NetworkStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let status = tokio::select! {
            () = gateway::stopped(&mut shutdown) => break,
            _ = ticker.tick() => probe.probe().await,
            signal = signals.recv() => match signal {
                Some(status) => status,
                None => break,
            },
        };
        if processor.handle_network_signal(status).await {
            debug!(%status, "network status changed");
        }
    }
    debug!("connectivity loop stopped");
}
