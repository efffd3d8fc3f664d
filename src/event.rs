use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::QueueStatus;
use crate::network::NetworkStatus;
use crate::payload::ImageBlob;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RequestId);

impl RequestId {
    /// Time-ordered prefix plus random tail.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Broadcast to every connected foreground context. Fire-and-forget.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    NetworkStatusChange {
        status: NetworkStatus,
    },
    #[serde(rename_all = "camelCase")]
    AiRequestQueued {
        request_id: RequestId,
        queue_length: usize,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    AiRequestSuccess {
        request_id: RequestId,
        queue_length: usize,
        image_blob: Option<ImageBlob>,
    },
    #[serde(rename_all = "camelCase")]
    AiRequestFailed {
        request_id: RequestId,
        error: String,
        max_retries_exceeded: bool,
        queue_length: usize,
    },
    #[serde(rename_all = "camelCase")]
    AiRequestQueueCleared {
        queue_length: usize,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ClientEvent::AiRequestQueued { request_id, .. }
            | ClientEvent::AiRequestSuccess { request_id, .. }
            | ClientEvent::AiRequestFailed { request_id, .. } => Some(request_id),
            ClientEvent::NetworkStatusChange { .. } | ClientEvent::AiRequestQueueCleared { .. } => {
                None
            }
        }
    }

    /// True for the success or permanent failure of `id`.
    pub fn is_outcome_for(&self, id: &RequestId) -> bool {
        matches!(
            self,
            ClientEvent::AiRequestSuccess { request_id, .. }
                | ClientEvent::AiRequestFailed { request_id, .. }
                if request_id == id
        )
    }
}

/// Requests a foreground context may send to the worker.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    GetNetworkStatus,
    GetQueueStatus,
    RetryFailedRequests,
    ClearAiQueue,
}

/// What the gateway sends back. `Acknowledged` serializes as `null`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum GatewayReply {
    NetworkStatus { status: NetworkStatus },
    QueueStatus(QueueStatus),
    Acknowledged,
}
