use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::SerializedRequest;
use crate::event::RequestId;

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// One edit request waiting for delivery.
///
/// `id` and `timestamp` are fixed at enqueue. `retry_count` only grows, one
/// step per failed attempt, and the processor drops the item once it reaches
/// the configured maximum.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub request_data: SerializedRequest,
    pub timestamp: UnixTimeMs,
    pub retry_count: u32,
}

impl QueuedRequest {
    pub fn new(request_data: SerializedRequest) -> Self {
        Self {
            id: RequestId::generate(),
            request_data,
            timestamp: UnixTimeMs::now(),
            retry_count: 0,
        }
    }
}

// Headers may carry credentials and the body is an image; keep both out of logs.
impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("method", &self.request_data.method)
            .field("url", &self.request_data.url)
            .field("header_count", &self.request_data.headers.len())
            .field(
                "body_len",
                &self.request_data.body.as_ref().map(Vec::len),
            )
            .field("timestamp", &self.timestamp)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Answer to `GET_QUEUE_STATUS`. `queue_length` counts pending items only.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
}
