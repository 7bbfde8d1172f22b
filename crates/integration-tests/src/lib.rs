//! Shared fixtures: a full application context over the in-memory gateway
//! and a file-backed local store in a temporary directory.

use std::path::Path;
use std::sync::Arc;

use cb_core::Table;
use cb_gateway_memory::{ManualClock, MemoryGateway, MemoryObjectStore};
use cb_services::{AppContext, ContextOptions, Ports, Registration, RegistrationForm};
use cb_storage_local::FileKeyValueStore;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

pub struct Campus {
    pub ctx: AppContext,
    pub gateway: Arc<MemoryGateway>,
    pub objects: Arc<MemoryObjectStore>,
    pub local: Arc<FileKeyValueStore>,
    pub clock: Arc<ManualClock>,
}

impl Campus {
    pub fn new(data_dir: &Path) -> Self {
        Self::with_options(data_dir, ContextOptions::default())
    }

    pub fn with_options(data_dir: &Path, options: ContextOptions) -> Self {
        let clock = Arc::new(ManualClock::at(Utc::now()));
        let gateway = Arc::new(MemoryGateway::with_clock(clock.clone()));
        let objects = Arc::new(MemoryObjectStore::new());
        let local = Arc::new(FileKeyValueStore::new(data_dir));
        let ctx = AppContext::new(
            Ports {
                data: gateway.clone(),
                auth: gateway.clone(),
                objects: objects.clone(),
                local: local.clone(),
                clock: clock.clone(),
            },
            options,
        );
        Self { ctx, gateway, objects, local, clock }
    }

    pub async fn register(&self, username: &str, community: &str) -> cb_core::Result<Registration> {
        self.ctx
            .session()
            .register(RegistrationForm {
                username: username.into(),
                password: "secret123".into(),
                confirm_password: "secret123".into(),
                community: community.into(),
                grade: Some("Year 2".into()),
            })
            .await
    }

    /// Seeds an already-reviewed post directly into the backend.
    pub async fn published_post(&self, author_id: Uuid, title: &str, visibility: &str, minutes_ago: i64) -> Uuid {
        let id = Uuid::now_v7();
        self.gateway
            .seed(
                Table::Posts,
                json!({
                    "id": id,
                    "author_id": author_id,
                    "title": title,
                    "body": "See you there",
                    "category": "social",
                    "visibility": visibility,
                    "status": "published",
                    "created_at": Utc::now() - Duration::minutes(minutes_ago),
                    "like_count": 0,
                    "comment_count": 0,
                }),
            )
            .await;
        id
    }
}
