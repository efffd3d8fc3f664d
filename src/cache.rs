use lru::LruCache;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::capabilities::http::HttpResponse;
use crate::model::UnixTimeMs;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("response body too large to cache: {size} bytes, max {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("cache capacity must be non-zero")]
    ZeroCapacity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub cached_at: UnixTimeMs,
}

impl CachedResponse {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: response.status(),
            content_type: response.header("content-type").map(str::to_string),
            body: response.body().to_vec(),
            cached_at: UnixTimeMs::now(),
        }
    }
}

/// Completed edit results, newest `capacity` kept.
///
/// Eviction follows insertion order: lookups use `peek` and never refresh an
/// entry.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CachedResponse>>,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize, max_body_bytes: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::ZeroCapacity)?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_body_bytes,
        })
    }

    /// `prefix-<millis>-<random>`
    pub fn generate_key(prefix: &str) -> String {
        let salt: u32 = rand::thread_rng().gen();
        format!("{prefix}-{}-{salt:08x}", UnixTimeMs::now().0)
    }

    pub fn put(&self, key: impl Into<String>, response: CachedResponse) -> Result<(), CacheError> {
        if response.body.len() > self.max_body_bytes {
            return Err(CacheError::BodyTooLarge {
                size: response.body.len(),
                max: self.max_body_bytes,
            });
        }

        let key = key.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, _)) = entries.push(key.clone(), response) {
            if evicted != key {
                debug!(%evicted, "response cache full, evicted oldest entry");
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: Some("image/png".into()),
            body: vec![byte; 4],
            cached_at: UnixTimeMs(1),
        }
    }

    #[test]
    fn eleventh_insert_evicts_oldest() {
        let cache = ResponseCache::new(10, 1024).unwrap();
        for n in 0..11u8 {
            cache.put(format!("k{n}"), entry(n)).unwrap();
            assert!(cache.len() <= 10);
        }

        assert_eq!(cache.len(), 10);
        assert!(cache.get("k0").is_none());
        assert_eq!(cache.get("k10"), Some(entry(10)));
        assert_eq!(cache.keys().first().map(String::as_str), Some("k1"));
    }

    #[test]
    fn reads_do_not_refresh_recency() {
        let cache = ResponseCache::new(2, 1024).unwrap();
        cache.put("a", entry(1)).unwrap();
        cache.put("b", entry(2)).unwrap();

        assert!(cache.get("a").is_some());
        cache.put("c", entry(3)).unwrap();

        assert!(cache.get("a").is_none());
        assert_eq!(cache.keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let cache = ResponseCache::new(10, 3).unwrap();
        assert_eq!(
            cache.put("big", entry(0)),
            Err(CacheError::BodyTooLarge { size: 4, max: 3 })
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            ResponseCache::new(0, 10),
            Err(CacheError::ZeroCapacity)
        ));
    }

    #[test]
    fn generated_keys_are_prefixed_and_distinct() {
        let a = ResponseCache::generate_key("ai-response");
        let b = ResponseCache::generate_key("ai-response");
        assert!(a.starts_with("ai-response-"));
        assert_ne!(a, b);
    }
}
