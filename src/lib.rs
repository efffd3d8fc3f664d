#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! Offline-resilient queue for outbound image edit requests.
//!
//! A failing `POST /edit-image` is captured by the [`interceptor`], stored by
//! the [`processor`] and replayed one request at a time once the
//! [`network`] monitor reports connectivity. Foreground contexts follow
//! progress through [`notifier`] events and query state through the
//! [`gateway`].

pub mod cache;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod edit;
pub mod event;
pub mod gateway;
pub mod interceptor;
pub mod model;
pub mod network;
pub mod notifier;
pub mod payload;
pub mod processor;
pub mod store;
pub mod worker;

use std::time::Duration;
use thiserror::Error;

pub use capabilities::http::{HttpError, HttpResponse, ReqwestTransport, Transport};
pub use config::{ConfigError, StoreLocation, WorkerConfig};
pub use event::{ClientEvent, ClientMessage, GatewayReply, RequestId};
pub use gateway::{GatewayHandle, MessageGateway};
pub use interceptor::{EditInterceptor, InterceptError};
pub use model::{QueueStatus, QueuedRequest, UnixTimeMs};
pub use network::{ConnectivityProbe, HttpProbe, NetworkMonitor, NetworkStatus};
pub use notifier::{ClientNotifier, Subscription};
pub use processor::QueueProcessor;
pub use store::{FileStore, MemoryStore, QueueStore, StoreError};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use worker::BackgroundWorker;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60000;
pub const INTER_REQUEST_DELAY_MS: u64 = 1000;
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESPONSE_CACHE_CAPACITY: usize = 10;
pub const MAX_CACHED_BODY_BYTES: usize = 20 * 1024 * 1024;
pub const CALLER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const EDIT_IMAGE_PATH: &str = "/edit-image";
pub const BROADCAST_CAPACITY: usize = 100;

/// Top-level failure of worker start-up.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Delay before the next attempt of a request that has failed
/// `retry_count` times, using the default base and cap.
#[must_use]
pub fn calculate_retry_delay(retry_count: u32) -> u64 {
    backoff_delay_ms(retry_count, BASE_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS)
}

#[must_use]
pub fn backoff_delay_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(retry_count));
    exponential.min(max_ms)
}
