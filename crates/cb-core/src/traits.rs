//! # Core Traits (Ports)
//!
//! Any adapter must implement these traits to be wired into the services.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::models::SessionUser;
use crate::query::{Filter, Row, RowPage, Select, Table};

/// Table/row contract of the hosted backend.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DataGateway: Send + Sync {
    /// The signed-in user for the current session, if any.
    async fn current_session(&self) -> anyhow::Result<Option<SessionUser>>;

    async fn select(&self, table: Table, query: &Select) -> anyhow::Result<RowPage>;
    async fn insert(&self, table: Table, rows: Vec<Row>) -> anyhow::Result<Vec<Row>>;
    /// Returns the number of rows removed.
    async fn delete(&self, table: Table, filter: &Filter) -> anyhow::Result<u64>;

    /// Exact number of rows matching `filter`.
    async fn count(&self, table: Table, filter: &Filter) -> anyhow::Result<u64> {
        let page = self.select(table, &Select::new(filter.clone()).range(0, 0)).await?;
        Ok(page.total)
    }
}

/// Account contract of the hosted backend.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Creates the account and opens a session for it.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<SessionUser>;
    async fn sign_in(&self, email: &str, password: &str) -> anyhow::Result<SessionUser>;
    async fn sign_out(&self) -> anyhow::Result<()>;
}

/// Object storage contract for post image uploads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores raw bytes under `bucket/path`.
    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> anyhow::Result<()>;
    /// Returns the public URL of a stored object.
    async fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Persistent client-side key-value storage (string values).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}

/// Time source, injectable so expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
