use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::Expiry;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key-value store with per-entry expiration. Reads after expiry behave as
/// absent. No transactional guarantees, callers re-validate freshness
/// themselves.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_capacity")]
    pub capacity: u64,
}

impl CacheConfig {
    fn default_capacity() -> u64 {
        10_000
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process store. Each entry expires after the TTL its writer asked for.
pub struct MemoryCache {
    inner: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(config.capacity)
                .expire_after(EntryTtl)
                .build(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.inner
            .insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}
