//! Object storage, key-value storage and a hand-driven clock, all in memory.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use cb_core::{Clock, KeyValueStore, ObjectStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, (Bytes, String)>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Stored bytes and content type.
    pub fn get(&self, bucket: &str, path: &str) -> Option<(Bytes, String)> {
        self.objects.get(&format!("{bucket}/{path}")).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.objects.insert(format!("{bucket}/{path}"), (data, content_type.to_string()));
        Ok(())
    }

    async fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn starting_now() -> Self {
        Self::at(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
