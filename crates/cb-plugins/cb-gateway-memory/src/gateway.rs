//! In-process stand-in for the hosted backend.
//!
//! Evaluates [`Select`] the way the remote query layer does: embeds are
//! materialized first so filters can reach into them, then filter, order,
//! count and window are applied in that order.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use cb_core::{AuthGateway, Clock, DataGateway, Embed, EmbedKind, Filter, Row, RowPage, Select, SessionUser, SystemClock, Table};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::debug;
use uuid::Uuid;

/// A call parked after it has taken effect, until [`HeldCall::release`].
///
/// Lets tests interleave other work between a remote call landing and
/// its caller seeing the result.
pub struct HeldCall {
    reached: Notify,
    open: watch::Sender<bool>,
}

impl HeldCall {
    fn new() -> Self {
        Self { reached: Notify::new(), open: watch::Sender::new(false) }
    }

    /// Resolves once the held call has been applied and is waiting.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    async fn park(&self) {
        self.reached.notify_one();
        let mut open = self.open.subscribe();
        // The sender lives in `self`, so this only ends on release.
        let _ = open.wait_for(|open| *open).await;
    }
}

struct Account {
    id: Uuid,
    password: String,
}

pub struct MemoryGateway {
    tables: DashMap<Table, Vec<Row>>,
    /// Tables that currently fail every call, to simulate an outage.
    unavailable: DashSet<Table>,
    accounts: DashMap<String, Account>,
    session: Mutex<Option<SessionUser>>,
    holds: Mutex<HashMap<Table, Arc<HeldCall>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Server-assigned `created_at` values come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: DashMap::new(),
            unavailable: DashSet::new(),
            accounts: DashMap::new(),
            session: Mutex::new(None),
            holds: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Inserts a row as-is, bypassing outage simulation and defaults.
    pub async fn seed(&self, table: Table, row: Value) {
        if let Value::Object(row) = row {
            self.tables.entry(table).or_default().push(row);
        }
    }

    /// Snapshot of a table's rows.
    pub async fn rows(&self, table: Table) -> Vec<Row> {
        self.rows_now(table)
    }

    pub fn set_unavailable(&self, table: Table, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(table);
        } else {
            self.unavailable.remove(&table);
        }
    }

    pub fn set_session(&self, user: Option<SessionUser>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = user;
    }

    /// Parks the next call against `table` after it is applied.
    pub fn hold_next(&self, table: Table) -> Arc<HeldCall> {
        let held = Arc::new(HeldCall::new());
        self.holds.lock().unwrap_or_else(PoisonError::into_inner).insert(table, held.clone());
        held
    }

    async fn settle(&self, table: Table) {
        let held = self.holds.lock().unwrap_or_else(PoisonError::into_inner).remove(&table);
        if let Some(held) = held {
            held.park().await;
        }
    }

    fn check_available(&self, table: Table) -> anyhow::Result<()> {
        if self.unavailable.contains(&table) {
            bail!("{table} is unavailable (503)");
        }
        Ok(())
    }

    fn with_embeds(&self, row: Row, select: &Select) -> Row {
        self.embed_into(row, &select.embeds)
    }

    fn embed_into(&self, mut row: Row, embeds: &[Embed]) -> Row {
        for embed in embeds {
            let related = self.rows_now(embed.table);
            let value = match &embed.kind {
                EmbedKind::One { local_key } => {
                    let key = row.get(local_key).cloned().unwrap_or(Value::Null);
                    related
                        .into_iter()
                        .find(|child| !key.is_null() && child.get("id") == Some(&key))
                        .map(|child| Value::Object(self.embed_into(child, &embed.embeds)))
                        .unwrap_or(Value::Null)
                }
                EmbedKind::Many { foreign_key } => {
                    let id = row.get("id").cloned().unwrap_or(Value::Null);
                    Value::Array(
                        related
                            .into_iter()
                            .filter(|child| !id.is_null() && child.get(foreign_key) == Some(&id))
                            .map(|child| Value::Object(self.embed_into(child, &embed.embeds)))
                            .collect(),
                    )
                }
            };
            row.insert(embed.alias.clone(), value);
        }
        row
    }

    fn rows_now(&self, table: Table) -> Vec<Row> {
        self.tables.get(&table).map(|rows| rows.value().clone()).unwrap_or_default()
    }
}

/// Orders JSON values the way the backend orders their column types:
/// timestamps chronologically, numbers numerically, nulls first.
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl DataGateway for MemoryGateway {
    async fn current_session(&self) -> anyhow::Result<Option<SessionUser>> {
        Ok(self.session.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn select(&self, table: Table, query: &Select) -> anyhow::Result<RowPage> {
        self.check_available(table)?;
        let mut rows: Vec<Row> = self
            .rows_now(table)
            .into_iter()
            .map(|row| self.with_embeds(row, query))
            .filter(|row| query.filter.matches(row))
            .collect();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                if order.descending { ord.reverse() } else { ord }
            });
        }

        let total = rows.len() as u64;
        if let Some(range) = query.range {
            rows = rows
                .into_iter()
                .skip(range.offset as usize)
                .take(range.limit as usize)
                .collect();
        }
        debug!(%table, total, returned = rows.len(), "memory select");
        self.settle(table).await;
        Ok(RowPage { rows, total })
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        self.check_available(table)?;
        let now = serde_json::to_value(self.clock.now())?;
        let inserted: Vec<Row> = rows
            .into_iter()
            .map(|mut row| {
                row.entry("id").or_insert_with(|| Value::String(Uuid::now_v7().to_string()));
                if row.get("created_at").map_or(true, Value::is_null) {
                    row.insert("created_at".into(), now.clone());
                }
                row
            })
            .collect();
        self.tables.entry(table).or_default().extend(inserted.iter().cloned());
        self.settle(table).await;
        Ok(inserted)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> anyhow::Result<u64> {
        self.check_available(table)?;
        let removed = {
            let mut rows = self.tables.entry(table).or_default();
            let before = rows.len();
            rows.retain(|row| !filter.matches(row));
            (before - rows.len()) as u64
        };
        self.settle(table).await;
        Ok(removed)
    }
}

#[async_trait]
impl AuthGateway for MemoryGateway {
    async fn sign_up(&self, email: &str, password: &str, _metadata: Value) -> anyhow::Result<SessionUser> {
        if self.accounts.contains_key(email) {
            bail!("user already registered");
        }
        let id = Uuid::now_v7();
        self.accounts.insert(email.to_string(), Account { id, password: password.to_string() });
        let user = SessionUser { id, email: email.to_string() };
        self.set_session(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> anyhow::Result<SessionUser> {
        let id = match self.accounts.get(email) {
            Some(account) if account.password == password => account.id,
            _ => return Err(anyhow!("invalid login credentials")),
        };
        let user = SessionUser { id, email: email.to_string() };
        self.set_session(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        self.set_session(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_core::Order;
    use serde_json::json;

    async fn gateway_with_posts() -> MemoryGateway {
        let gateway = MemoryGateway::new();
        gateway.seed(Table::Profiles, json!({ "id": "u1", "community": "north" })).await;
        gateway.seed(Table::Profiles, json!({ "id": "u2", "community": "south" })).await;
        for (id, author, at) in [
            ("p1", "u1", "2025-05-01T10:00:00Z"),
            ("p2", "u2", "2025-05-01T11:00:00.5Z"),
            ("p3", "u1", "2025-05-01T09:00:00.123456Z"),
        ] {
            gateway.seed(Table::Posts, json!({ "id": id, "author_id": author, "created_at": at })).await;
        }
        gateway
    }

    #[tokio::test]
    async fn test_filter_through_embedded_relation() {
        let gateway = gateway_with_posts().await;
        let select = Select::new(Filter::eq("author.community", "north"))
            .order(Order::desc("created_at"))
            .embed(Embed::one("author", Table::Profiles, "author_id"));

        let page = gateway.select(Table::Posts, &select).await.unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(page.rows[0]["author"]["community"], "north");
    }

    #[tokio::test]
    async fn test_timestamps_order_chronologically_across_precisions() {
        let gateway = gateway_with_posts().await;
        let page = gateway
            .select(Table::Posts, &Select::new(Filter::All).order(Order::asc("created_at")))
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["p3", "p1", "p2"]);
    }

    #[tokio::test]
    async fn test_range_window_keeps_exact_total() {
        let gateway = gateway_with_posts().await;
        let page = gateway.select(Table::Posts, &Select::new(Filter::All).range(1, 1)).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.total, 3);
        assert_eq!(gateway.count(Table::Posts, &Filter::eq("author_id", "u1")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_assigns_server_columns_and_delete_counts() {
        let gateway = MemoryGateway::new();
        let row = json!({ "user_id": "u1", "post_id": "p1" }).as_object().cloned().unwrap();
        let inserted = gateway.insert(Table::Likes, vec![row]).await.unwrap();
        assert!(inserted[0].contains_key("id"));
        assert!(inserted[0]["created_at"].is_string());

        let removed = gateway.delete(Table::Likes, &Filter::eq("post_id", "p1")).await.unwrap();
        assert_eq!(removed, 1);
        assert!(gateway.rows(Table::Likes).await.is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_only_the_marked_table() {
        let gateway = gateway_with_posts().await;
        gateway.set_unavailable(Table::Posts, true);
        assert!(gateway.select(Table::Posts, &Select::new(Filter::All)).await.is_err());
        assert!(gateway.select(Table::Profiles, &Select::new(Filter::All)).await.is_ok());
    }

    #[tokio::test]
    async fn test_nested_embeds_follow_each_level() {
        let gateway = gateway_with_posts().await;
        gateway.seed(Table::Badges, json!({ "id": "b1", "name": "Helper" })).await;
        gateway.seed(Table::UserBadges, json!({ "user_id": "u1", "badge_id": "b1" })).await;
        let author = Embed::one("author", Table::Profiles, "author_id")
            .with(Embed::many("badges", Table::UserBadges, "user_id").with(Embed::one("badge", Table::Badges, "badge_id")));
        let select = Select::new(Filter::eq("id", "p1")).embed(author);

        let page = gateway.select(Table::Posts, &select).await.unwrap();
        assert_eq!(page.rows[0]["author"]["badges"][0]["badge"]["name"], "Helper");
    }

    #[tokio::test]
    async fn test_held_call_lands_before_release() {
        let gateway = gateway_with_posts().await;
        let held = gateway.hold_next(Table::Likes);
        let row = json!({ "user_id": "u1", "post_id": "p1" }).as_object().cloned().unwrap();

        let (inserted, _) = tokio::join!(gateway.insert(Table::Likes, vec![row]), async {
            held.reached().await;
            assert_eq!(gateway.rows(Table::Likes).await.len(), 1);
            held.release();
        });
        assert_eq!(inserted.unwrap().len(), 1);
        // One-shot: the next call is not parked.
        assert_eq!(gateway.delete(Table::Likes, &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accounts_and_session() {
        let gateway = MemoryGateway::new();
        let user = gateway.sign_up("a@x.edu", "pw1234", json!({})).await.unwrap();
        assert!(gateway.sign_up("a@x.edu", "other1", json!({})).await.is_err());
        assert_eq!(gateway.current_session().await.unwrap(), Some(user.clone()));

        gateway.sign_out().await.unwrap();
        assert_eq!(gateway.current_session().await.unwrap(), None);
        assert!(gateway.sign_in("a@x.edu", "wrong1").await.is_err());
        assert_eq!(gateway.sign_in("a@x.edu", "pw1234").await.unwrap().id, user.id);
    }
}
