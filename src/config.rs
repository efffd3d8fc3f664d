use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::network::NetworkStatus;

const ENV_PREFIX: &str = "EDIT_QUEUE_";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// File extension that selects the single-file store over SQLite.
pub const FILE_STORE_EXTENSION: &str = "cbor";

/// Where the queue lives, derived from `database_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation<'a> {
    Memory,
    Sqlite(&'a Path),
    /// Checksummed CBOR snapshot, chosen by a `.cbor` extension.
    File(&'a Path),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub inter_request_delay_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Edit API root; `/edit-image` is resolved against it.
    pub api_base_url: Url,
    /// Defaults to `api_base_url`.
    pub probe_url: Option<Url>,
    pub cache_capacity: usize,
    pub max_cached_body_bytes: usize,
    pub caller_timeout_ms: u64,
    pub intercept_path: String,
    /// `None` keeps the queue in memory only. See [`StoreLocation`].
    pub database_path: Option<PathBuf>,
    pub broadcast_capacity: usize,
    pub initial_network_status: NetworkStatus,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_backoff_ms: crate::BASE_RETRY_DELAY_MS,
            max_backoff_ms: crate::MAX_RETRY_DELAY_MS,
            inter_request_delay_ms: crate::INTER_REQUEST_DELAY_MS,
            probe_interval_ms: crate::PROBE_INTERVAL.as_millis() as u64,
            probe_timeout_ms: crate::PROBE_TIMEOUT.as_millis() as u64,
            api_base_url: Url::parse(DEFAULT_API_BASE_URL)
                .unwrap_or_else(|_| unreachable!("default API URL is valid")),
            probe_url: None,
            cache_capacity: crate::RESPONSE_CACHE_CAPACITY,
            max_cached_body_bytes: crate::MAX_CACHED_BODY_BYTES,
            caller_timeout_ms: crate::CALLER_TIMEOUT.as_millis() as u64,
            intercept_path: crate::EDIT_IMAGE_PATH.to_string(),
            database_path: None,
            broadcast_capacity: crate::BROADCAST_CAPACITY,
            initial_network_status: NetworkStatus::Offline,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Validation("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Validation(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Validation("probe_interval_ms must be > 0".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Validation("probe_timeout_ms must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Validation("cache_capacity must be > 0".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Validation(
                "broadcast_capacity must be > 0".into(),
            ));
        }
        if !self.intercept_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "intercept_path must start with '/'".into(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `EDIT_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some(kv) = get("MAX_RETRIES") {
            config.max_retries = parse(kv)?;
        }
        if let Some(kv) = get("BASE_BACKOFF_MS") {
            config.base_backoff_ms = parse(kv)?;
        }
        if let Some(kv) = get("MAX_BACKOFF_MS") {
            config.max_backoff_ms = parse(kv)?;
        }
        if let Some(kv) = get("INTER_REQUEST_DELAY_MS") {
            config.inter_request_delay_ms = parse(kv)?;
        }
        if let Some(kv) = get("PROBE_INTERVAL_MS") {
            config.probe_interval_ms = parse(kv)?;
        }
        if let Some(kv) = get("PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = parse(kv)?;
        }
        if let Some(kv) = get("API_BASE_URL") {
            config.api_base_url = parse_url(kv)?;
        }
        if let Some(kv) = get("PROBE_URL") {
            config.probe_url = Some(parse_url(kv)?);
        }
        if let Some(kv) = get("CACHE_CAPACITY") {
            config.cache_capacity = parse(kv)?;
        }
        if let Some(kv) = get("MAX_CACHED_BODY_BYTES") {
            config.max_cached_body_bytes = parse(kv)?;
        }
        if let Some(kv) = get("CALLER_TIMEOUT_MS") {
            config.caller_timeout_ms = parse(kv)?;
        }
        if let Some((_, value)) = get("INTERCEPT_PATH") {
            config.intercept_path = value;
        }
        if let Some((_, value)) = get("DATABASE_PATH") {
            config.database_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(kv) = get("BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse(kv)?;
        }
        if let Some((key, value)) = get("INITIAL_NETWORK_STATUS") {
            config.initial_network_status = match value.to_ascii_lowercase().as_str() {
                "online" => NetworkStatus::Online,
                "offline" => NetworkStatus::Offline,
                _ => return Err(ConfigError::InvalidValue { key, value }),
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn probe_url(&self) -> &Url {
        self.probe_url.as_ref().unwrap_or(&self.api_base_url)
    }

    pub fn store_location(&self) -> StoreLocation<'_> {
        match self.database_path.as_deref() {
            None => StoreLocation::Memory,
            Some(path)
                if path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(FILE_STORE_EXTENSION)) =>
            {
                StoreLocation::File(path)
            }
            Some(path) => StoreLocation::Sqlite(path),
        }
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn caller_timeout(&self) -> Duration {
        Duration::from_millis(self.caller_timeout_ms)
    }

    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(crate::backoff_delay_ms(
            retry_count,
            self.base_backoff_ms,
            self.max_backoff_ms,
        ))
    }
}

fn parse<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn parse_url((key, value): (String, String)) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|_| ConfigError::InvalidValue { key, value })
}
