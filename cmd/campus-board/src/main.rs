//! # campus-board
//!
//! Headless client shell. Assembles the adapters selected by `backend.mode`,
//! restores any saved session and prints one page of the feed.
//!
//! Usage: `campus-board [global|community] [page]`

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use cb_config::{BackendMode, Settings};
use cb_core::{relative_time, Clock, KeyValueStore, Scope, SystemClock};
use cb_gateway_memory::MemoryGateway;
use cb_services::{AppContext, BadgePolicy, BadgeSpec, ContextOptions, FeedOptions, LoadOutcome, Ports};
use cb_storage_local::{FileKeyValueStore, LocalObjectStore};
use tracing::{info, warn};

fn context_options(settings: &Settings) -> anyhow::Result<ContextOptions> {
    let defaults = BadgePolicy::default();
    let badges = BadgePolicy {
        global_limit: settings.badges.global_limit,
        community_limit: settings.badges.community_limit,
        global: BadgeSpec { name: settings.badges.global_name.clone(), ..defaults.global },
        community: BadgeSpec { name: settings.badges.community_name.clone(), ..defaults.community },
        temporary_days: settings.badges.temporary_days,
    };
    let cache_ttl = chrono::Duration::from_std(settings.feed.cache_ttl()).context("feed.cache_ttl_secs is out of range")?;

    Ok(ContextOptions {
        feed: FeedOptions { page_size: settings.feed.page_size, cache_ttl },
        badges,
        email_domain: settings.auth.email_domain.clone(),
    })
}

fn build_ports(settings: &Settings) -> anyhow::Result<Ports> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let data_dir = &settings.storage.data_dir;
    let local: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(data_dir.join("kv")));

    match settings.backend.mode {
        BackendMode::Memory => {
            let gateway = Arc::new(MemoryGateway::with_clock(clock.clone()));
            let objects = Arc::new(LocalObjectStore::new(data_dir.join("objects"), file_url(data_dir)));
            Ok(Ports { data: gateway.clone(), auth: gateway, objects, local, clock })
        }
        BackendMode::Rest => rest_ports(settings, local, clock),
    }
}

fn file_url(data_dir: &Path) -> String {
    format!("file://{}", data_dir.join("objects").display())
}

#[cfg(feature = "gateway-rest")]
fn rest_ports(settings: &Settings, local: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> anyhow::Result<Ports> {
    use secrecy::{ExposeSecret, SecretString};

    let anon_key = SecretString::from(settings.backend.anon_key.expose_secret().to_owned());
    let gateway = Arc::new(cb_gateway_rest::RestGateway::new(&settings.backend.url, anon_key)?);
    Ok(Ports { data: gateway.clone(), auth: gateway.clone(), objects: gateway, local, clock })
}

#[cfg(not(feature = "gateway-rest"))]
fn rest_ports(_: &Settings, _: Arc<dyn KeyValueStore>, _: Arc<dyn Clock>) -> anyhow::Result<Ports> {
    bail!("built without the gateway-rest feature; set backend.mode = \"memory\"")
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<(Scope, u32)> {
    let scope = match args.next().as_deref() {
        None | Some("global") => Scope::Global,
        Some("community") => Scope::OwnCommunity,
        Some(other) => bail!("unknown scope {other:?}, expected global or community"),
    };
    let page = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid page {raw:?}"))?,
        None => 1,
    };
    Ok((scope, page))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    cb_config::telemetry::init(&settings.log)?;
    let (scope, page) = parse_args(std::env::args().skip(1))?;

    let clock = SystemClock;
    let ctx = AppContext::new(build_ports(&settings)?, context_options(&settings)?);

    let viewer = ctx.session().establish().await;
    info!(mode = ?settings.backend.mode, signed_in = viewer.is_authenticated(), "campus-board started");
    if let Ok(admin) = ctx.admin().check().await {
        info!(email = %admin.email, "admin session present");
    }

    let feed = ctx.feed(viewer);
    match feed.load_feed(scope, page).await {
        Ok(LoadOutcome::Loaded(loaded)) => {
            println!("{} page {} ({} posts total)", loaded.scope.as_str(), loaded.page, loaded.total);
            let now = clock.now();
            for card in &loaded.cards {
                let author = match (&card.post.author, card.post.anonymous) {
                    (_, true) => "anonymous".to_string(),
                    (Some(profile), _) => match &card.primary_badge {
                        Some(badge) => format!("{} [{}]", profile.username, badge.name),
                        None => profile.username.clone(),
                    },
                    (None, _) => card.post.author_id.to_string(),
                };
                println!(
                    "- {} by {} · {} · {} likes · {} comments",
                    card.post.title,
                    author,
                    relative_time(card.post.created_at, now),
                    card.post.like_count,
                    card.post.comment_count,
                );
            }
        }
        Ok(LoadOutcome::Empty { scope, page }) => println!("{} page {page}: nothing here yet", scope.as_str()),
        Ok(LoadOutcome::Superseded) => {}
        Err(e) => {
            warn!(error = %e, "feed unavailable");
            return Err(e.into());
        }
    }
    Ok(())
}
