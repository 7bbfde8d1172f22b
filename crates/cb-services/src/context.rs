//! Wiring: one place that owns the adapters and hands out services bound
//! to a particular viewer.

use std::sync::Arc;

use cb_core::{AuthGateway, Clock, DataGateway, KeyValueStore, ObjectStore, Viewer};

use crate::admin::AdminGuard;
use crate::badges::{BadgeEvaluator, BadgePolicy};
use crate::cache::ExpiringCache;
use crate::compose::ComposerService;
use crate::detail::PostDetailService;
use crate::feed::{FeedManager, FeedOptions};
use crate::session::{SessionService, DEFAULT_EMAIL_DOMAIN};

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub feed: FeedOptions,
    pub badges: BadgePolicy,
    pub email_domain: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { feed: FeedOptions::default(), badges: BadgePolicy::default(), email_domain: DEFAULT_EMAIL_DOMAIN.into() }
    }
}

pub struct Ports {
    pub data: Arc<dyn DataGateway>,
    pub auth: Arc<dyn AuthGateway>,
    pub objects: Arc<dyn ObjectStore>,
    pub local: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppContext {
    data: Arc<dyn DataGateway>,
    auth: Arc<dyn AuthGateway>,
    objects: Arc<dyn ObjectStore>,
    local: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    cache: Arc<ExpiringCache>,
    badges: Arc<BadgeEvaluator>,
    options: ContextOptions,
}

impl AppContext {
    pub fn new(ports: Ports, options: ContextOptions) -> Self {
        let cache = Arc::new(
            ExpiringCache::new(ports.local.clone(), ports.clock.clone()).with_default_ttl(options.feed.cache_ttl),
        );
        let badges = Arc::new(BadgeEvaluator::new(ports.data.clone(), ports.clock.clone(), options.badges.clone()));
        Self {
            data: ports.data,
            auth: ports.auth,
            objects: ports.objects,
            local: ports.local,
            clock: ports.clock,
            cache,
            badges,
            options,
        }
    }

    pub fn cache(&self) -> Arc<ExpiringCache> {
        self.cache.clone()
    }

    pub fn session(&self) -> SessionService {
        SessionService::new(
            self.data.clone(),
            self.auth.clone(),
            self.cache.clone(),
            self.badges.clone(),
            self.options.email_domain.clone(),
        )
    }

    pub fn admin(&self) -> AdminGuard {
        AdminGuard::new(self.local.clone())
    }

    pub fn feed(&self, viewer: Viewer) -> FeedManager {
        FeedManager::new(self.data.clone(), self.cache.clone(), self.clock.clone(), viewer, self.options.feed.clone())
    }

    pub fn composer(&self, viewer: Viewer) -> ComposerService {
        ComposerService::new(self.data.clone(), self.objects.clone(), self.clock.clone(), viewer)
    }

    pub fn detail(&self, viewer: Viewer) -> PostDetailService {
        PostDetailService::new(self.data.clone(), self.cache.clone(), self.clock.clone(), viewer)
    }
}
