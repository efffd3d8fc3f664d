use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capabilities::http::{HttpError, HttpResponse, Transport};
use crate::codec;
use crate::event::{ClientEvent, RequestId};
use crate::notifier::{ClientNotifier, Subscription};
use crate::payload::ImageBlob;
use crate::processor::QueueProcessor;

#[derive(Debug, Error)]
pub enum InterceptError {
    /// The first attempt failed. `queued` names the queue entry when the
    /// request was captured for replay.
    #[error("request failed: {source}")]
    Failed {
        #[source]
        source: HttpError,
        queued: Option<RequestId>,
    },

    #[error("gave up waiting for queued request {0}")]
    Timeout(RequestId),

    #[error("queued request {request_id} failed permanently: {error}")]
    PermanentFailure {
        request_id: RequestId,
        error: String,
        max_retries_exceeded: bool,
    },

    #[error("worker stopped before queued request {0} finished")]
    Disconnected(RequestId),
}

impl InterceptError {
    pub fn queued_id(&self) -> Option<&RequestId> {
        match self {
            InterceptError::Failed { queued, .. } => queued.as_ref(),
            InterceptError::Timeout(id)
            | InterceptError::Disconnected(id)
            | InterceptError::PermanentFailure { request_id: id, .. } => Some(id),
        }
    }
}

/// Which outbound requests get queue protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptRule {
    method: reqwest::Method,
    path_suffix: String,
}

impl InterceptRule {
    pub fn new(method: reqwest::Method, path_suffix: impl Into<String>) -> Self {
        Self {
            method,
            path_suffix: path_suffix.into(),
        }
    }

    pub fn matches(&self, request: &reqwest::Request) -> bool {
        request.method() == self.method && request.url().path().ends_with(&self.path_suffix)
    }
}

impl Default for InterceptRule {
    fn default() -> Self {
        Self::new(reqwest::Method::POST, crate::EDIT_IMAGE_PATH)
    }
}

#[derive(Debug)]
pub enum EditOutcome {
    /// First attempt succeeded.
    Immediate(HttpResponse),
    /// Delivered later by the queue.
    Replayed {
        request_id: RequestId,
        image_blob: Option<ImageBlob>,
    },
}

/// Network boundary for foreground requests.
///
/// Matching requests are captured before the first attempt; if that attempt
/// fails the captured copy goes into the queue and the caller still sees the
/// failure.
pub struct EditInterceptor {
    transport: Arc<dyn Transport>,
    processor: Arc<QueueProcessor>,
    notifier: ClientNotifier,
    rule: InterceptRule,
    caller_timeout: Duration,
}

impl EditInterceptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<QueueProcessor>,
        notifier: ClientNotifier,
        rule: InterceptRule,
        caller_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            processor,
            notifier,
            rule,
            caller_timeout,
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method(), url = %request.url()))]
    pub async fn send(&self, request: reqwest::Request) -> Result<HttpResponse, InterceptError> {
        if !self.rule.matches(&request) {
            return self
                .transport
                .execute(request)
                .await
                .map_err(|source| InterceptError::Failed {
                    source,
                    queued: None,
                });
        }

        let captured = match codec::serialize(&request) {
            Ok(captured) => Some(captured),
            Err(e) => {
                warn!(error = %e, "edit request cannot be captured, sending without queue protection");
                None
            }
        };

        let failure = match self.transport.execute(request).await {
            Ok(response) if response.is_success() => return Ok(response),
            Ok(response) => HttpError::status(&response),
            Err(e) => e,
        };

        let queued = match captured {
            Some(captured) => Some(self.processor.enqueue(captured, failure.to_string()).await),
            None => None,
        };

        Err(InterceptError::Failed {
            source: failure,
            queued,
        })
    }

    /// Like [`send`](Self::send), but when the request was queued waits for
    /// its final outcome, up to the caller timeout.
    pub async fn send_and_wait(&self, request: reqwest::Request) -> Result<EditOutcome, InterceptError> {
        // subscribe first so a fast replay cannot be missed
        let mut events = self.notifier.subscribe();

        let request_id = match self.send(request).await {
            Ok(response) => return Ok(EditOutcome::Immediate(response)),
            Err(InterceptError::Failed {
                source,
                queued: Some(request_id),
            }) => {
                debug!(%request_id, error = %source, "waiting for queued request");
                request_id
            }
            Err(e) => return Err(e),
        };

        match tokio::time::timeout(self.caller_timeout, next_outcome(&mut events, &request_id)).await {
            Err(_) => Err(InterceptError::Timeout(request_id)),
            Ok(None) => Err(InterceptError::Disconnected(request_id)),
            Ok(Some(Ok(image_blob))) => Ok(EditOutcome::Replayed {
                request_id,
                image_blob,
            }),
            Ok(Some(Err((error, max_retries_exceeded)))) => Err(InterceptError::PermanentFailure {
                request_id,
                error,
                max_retries_exceeded,
            }),
        }
    }
}

type Outcome = Result<Option<ImageBlob>, (String, bool)>;

async fn next_outcome(events: &mut Subscription, request_id: &RequestId) -> Option<Outcome> {
    while let Some(event) = events.recv().await {
        if !event.is_outcome_for(request_id) {
            continue;
        }
        match event {
            ClientEvent::AiRequestSuccess { image_blob, .. } => return Some(Ok(image_blob)),
            ClientEvent::AiRequestFailed {
                error,
                max_retries_exceeded,
                ..
            } => return Some(Err((error, max_retries_exceeded))),
            _ => {}
        }
    }
    None
}
