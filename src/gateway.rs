use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::event::{ClientMessage, GatewayReply};
use crate::processor::QueueProcessor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway is not running")]
    ChannelClosed,

    #[error("message could not be encoded: {0}")]
    Encode(String),

    #[error("message not recognized by the gateway")]
    Unrecognized,
}

/// Request/response entry point for foreground contexts, dispatched on the
/// message `type`.
#[derive(Clone)]
pub struct MessageGateway {
    processor: Arc<QueueProcessor>,
}

impl MessageGateway {
    pub fn new(processor: Arc<QueueProcessor>) -> Self {
        Self { processor }
    }

    #[instrument(skip(self))]
    pub async fn handle(&self, message: ClientMessage) -> GatewayReply {
        match message {
            ClientMessage::GetNetworkStatus => GatewayReply::NetworkStatus {
                status: self.processor.network_status(),
            },
            ClientMessage::GetQueueStatus => {
                GatewayReply::QueueStatus(self.processor.queue_status().await)
            }
            ClientMessage::RetryFailedRequests => {
                let started = self.processor.retry_failed_requests().await;
                debug!(started, "retry requested");
                GatewayReply::Acknowledged
            }
            ClientMessage::ClearAiQueue => {
                self.processor.clear_queue().await;
                GatewayReply::Acknowledged
            }
        }
    }

    /// Unknown or malformed messages are logged and get no reply.
    pub async fn handle_value(&self, message: Value) -> Option<GatewayReply> {
        match serde_json::from_value::<ClientMessage>(message.clone()) {
            Ok(message) => Some(self.handle(message).await),
            Err(e) => {
                warn!(%message, error = %e, "ignoring unrecognized client message");
                None
            }
        }
    }

    pub async fn handle_raw(&self, raw: &str) -> Option<GatewayReply> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => {
                warn!(error = %e, "ignoring client message that is not JSON");
                None
            }
        }
    }

    /// Serves calls one at a time until every handle is dropped or
    /// `shutdown` flips to true.
    pub async fn serve(
        self,
        mut calls: mpsc::Receiver<GatewayCall>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                () = stopped(&mut shutdown) => break,
                call = calls.recv() => {
                    let Some(call) = call else { break };
                    let reply = self.handle_value(call.message).await;
                    let _ = call.reply.send(reply);
                }
            }
        }
        info!("message gateway stopped");
    }

    pub fn spawn(
        self,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (GatewayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.serve(rx, shutdown));
        (GatewayHandle { calls: tx }, task)
    }
}

pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[derive(Debug)]
pub struct GatewayCall {
    message: Value,
    reply: oneshot::Sender<Option<GatewayReply>>,
}

/// Cloneable client side of a running gateway.
#[derive(Clone, Debug)]
pub struct GatewayHandle {
    calls: mpsc::Sender<GatewayCall>,
}

impl GatewayHandle {
    pub async fn request(&self, message: ClientMessage) -> Result<GatewayReply, GatewayError> {
        let value =
            serde_json::to_value(message).map_err(|e| GatewayError::Encode(e.to_string()))?;
        self.request_value(value)
            .await?
            .ok_or(GatewayError::Unrecognized)
    }

    /// `Ok(None)` when the gateway did not recognize the message.
    pub async fn request_value(&self, message: Value) -> Result<Option<GatewayReply>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(GatewayCall { message, reply })
            .await
            .map_err(|_| GatewayError::ChannelClosed)?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)
    }
}
