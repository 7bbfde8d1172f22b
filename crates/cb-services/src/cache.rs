//! # Local expiring cache
//!
//! TTL-bounded key-value cache over persistent local storage. Expiry is
//! checked lazily on read; there is no sweeper and no size bound. Every key
//! is stored under [`CACHE_PREFIX`] so bulk invalidation leaves unrelated
//! persisted entries (e.g. the admin session) alone.
//!
//! Storage failures degrade to a cache miss; the cache never fails a caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cb_core::{Clock, KeyValueStore};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CACHE_PREFIX: &str = "cache_";

pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

/// What is persisted per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub expiry: DateTime<Utc>,
}

pub struct ExpiringCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    /// Bumped by every invalidation.
    epoch: AtomicU64,
}

impl ExpiringCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, default_ttl: default_ttl(), epoch: AtomicU64::new(0) }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn storage_key(key: &str) -> String {
        format!("{CACHE_PREFIX}{key}")
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "cache payload not serializable, skipping");
                return;
            }
        };
        let entry = CacheEntry { data, expiry: self.clock.now() + ttl };
        let encoded = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!(key, error = %e, "cache entry not encodable, skipping");
                return;
            }
        };
        if let Err(e) = self.store.set(&Self::storage_key(key), encoded).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    /// Read this before fetching a value that will be cached with
    /// [`ExpiringCache::put_unless_invalidated`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Stores `value` only if nothing was invalidated since `epoch` was read.
    /// An invalidation racing the write removes the entry again.
    pub async fn put_unless_invalidated<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, epoch: u64) -> bool {
        if self.epoch() != epoch {
            debug!(key, "invalidated while fetching, not caching");
            return false;
        }
        self.put(key, value, ttl).await;
        if self.epoch() != epoch {
            debug!(key, "invalidated while caching, dropping entry");
            self.invalidate_key(key).await;
            return false;
        }
        true
    }

    pub async fn put_default<T: Serialize>(&self, key: &str, value: &T) {
        self.put(key, value, self.default_ttl).await
    }

    /// Returns the cached value, or `None` when absent, expired or undecodable.
    /// Expired and undecodable entries are purged.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let storage_key = Self::storage_key(key);
        let raw = match self.store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry, purging");
                self.purge(&storage_key).await;
                return None;
            }
        };

        if self.clock.now() > entry.expiry {
            debug!(key, "cache entry expired, purging");
            self.purge(&storage_key).await;
            return None;
        }

        match serde_json::from_value(entry.data) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "cached payload has unexpected shape, purging");
                self.purge(&storage_key).await;
                None
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.invalidate_key(key).await
    }

    /// Drops every cache entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.purge_matching(&Self::storage_key(prefix)).await
    }

    /// Drops every cache entry; non-cache entries in the same storage survive.
    pub async fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.purge_matching(CACHE_PREFIX).await
    }

    async fn invalidate_key(&self, key: &str) {
        self.purge(&Self::storage_key(key)).await
    }

    async fn purge(&self, storage_key: &str) {
        if let Err(e) = self.store.remove(storage_key).await {
            warn!(storage_key, error = %e, "cache purge failed");
        }
    }

    async fn purge_matching(&self, storage_prefix: &str) {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "cannot list cache keys");
                return;
            }
        };
        for key in keys.iter().filter(|k| k.starts_with(storage_prefix)) {
            self.purge(key).await;
        }
    }
}
