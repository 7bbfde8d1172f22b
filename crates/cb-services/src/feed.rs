//! # Feed state manager
//!
//! Owns the posts currently on screen. Viewer intents come in through
//! [`FeedManager::dispatch`] (or the typed methods behind it); every change
//! to displayed state goes out as a [`FeedEvent`] on a broadcast channel.
//!
//! Rules:
//! - a load whose generation has been superseded is discarded on arrival;
//! - likes and favorites are optimistic and roll back to their pre-action
//!   value when the remote write fails;
//! - comments are created remotely first, then counted locally;
//! - the state lock is never held across a gateway call.

use std::collections::HashSet;
use std::sync::Arc;

use cb_core::{AppError, Badge, Clock, Comment, DataGateway, Post, Result, Scope, Table, Viewer};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ExpiringCache;
use crate::guard::SubmitGuard;
use crate::interactions::{self, Reaction};
use crate::resolver::{self, QuerySpec, DEFAULT_PAGE_SIZE};

/// Cache keys of every feed window start with this.
pub const FEED_CACHE_PREFIX: &str = "feed:";

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub page_size: u32,
    pub cache_ttl: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, cache_ttl: crate::cache::default_ttl() }
    }
}

/// A displayed post plus the viewer's own toggle state for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostCard {
    pub post: Post,
    pub liked: bool,
    pub favorited: bool,
    /// Shown beside the author's name; never set on anonymous posts.
    #[serde(default)]
    pub primary_badge: Option<Badge>,
}

/// What the cache holds per feed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedWindow {
    posts: Vec<Post>,
    total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub scope: Scope,
    pub page: u32,
    pub cards: Vec<PostCard>,
    /// Matching posts across all pages
    pub total: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(FeedPage),
    /// The query succeeded and matched nothing.
    Empty { scope: Scope, page: u32 },
    /// A newer load was issued while this one was in flight; its result was dropped.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedIntent {
    Load { scope: Scope, page: u32 },
    SwitchScope(Scope),
    Refresh,
    ToggleLike(Uuid),
    ToggleFavorite(Uuid),
    SubmitComment { post_id: Uuid, content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Loaded { scope: Scope, page: u32, cards: Vec<PostCard>, total: u64 },
    Empty { scope: Scope, page: u32 },
    LoadFailed { scope: Scope, page: u32, error: AppError },
    PostUpdated(PostCard),
    /// An optimistic change was undone; `card` is the restored state.
    MutationRolledBack { post_id: Uuid, card: Option<PostCard>, error: AppError },
    CommentAdded { post_id: Uuid, comment: Comment },
    /// The viewer tried something that needs a signed-in account.
    LoginRequired { action: &'static str },
}

/// Point-in-time copy of what is on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    pub scope: Scope,
    pub page: u32,
    pub cards: Vec<PostCard>,
    pub total: u64,
}

#[derive(Debug)]
struct FeedState {
    scope: Scope,
    page: u32,
    /// Bumped on every load request; responses carry the value they were issued under.
    generation: u64,
    cards: Vec<PostCard>,
    total: u64,
}

pub struct FeedManager {
    gateway: Arc<dyn DataGateway>,
    cache: Arc<ExpiringCache>,
    clock: Arc<dyn Clock>,
    viewer: Viewer,
    options: FeedOptions,
    state: Mutex<FeedState>,
    events: broadcast::Sender<FeedEvent>,
    comments_in_flight: SubmitGuard,
}

impl FeedManager {
    pub fn new(
        gateway: Arc<dyn DataGateway>,
        cache: Arc<ExpiringCache>,
        clock: Arc<dyn Clock>,
        viewer: Viewer,
        options: FeedOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let scope = resolver::effective_scope(&viewer, Scope::OwnCommunity);
        Self {
            gateway,
            cache,
            clock,
            viewer,
            options,
            state: Mutex::new(FeedState { scope, page: 1, generation: 0, cards: vec![], total: 0 }),
            events,
            comments_in_flight: SubmitGuard::new(),
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FeedEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let state = self.state.lock().await;
        FeedSnapshot { scope: state.scope, page: state.page, cards: state.cards.clone(), total: state.total }
    }

    pub fn is_submitting_comment(&self, post_id: Uuid) -> bool {
        self.comments_in_flight.is_busy(&post_id.to_string())
    }

    /// Routes an intent to its handler. Outcomes are published as events.
    pub async fn dispatch(&self, intent: FeedIntent) -> Result<()> {
        match intent {
            FeedIntent::Load { scope, page } => self.load_feed(scope, page).await.map(|_| ()),
            FeedIntent::SwitchScope(scope) => self.switch_scope(scope).await.map(|_| ()),
            FeedIntent::Refresh => self.refresh().await.map(|_| ()),
            FeedIntent::ToggleLike(post_id) => self.toggle(Reaction::Like, post_id).await.map(|_| ()),
            FeedIntent::ToggleFavorite(post_id) => self.toggle(Reaction::Favorite, post_id).await.map(|_| ()),
            FeedIntent::SubmitComment { post_id, content } => {
                self.append_comment(post_id, &content).await.map(|_| ())
            }
        }
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    /// Loads one window of the feed. The scope reported back is the one the
    /// viewer is actually served, so an anonymous request for community scope
    /// comes back as global. Landing on a scope other than the one on screen
    /// restarts at page 1; the previous scope's posts are replaced, never merged.
    pub async fn load_feed(&self, requested: Scope, page: u32) -> Result<LoadOutcome> {
        let scope = resolver::effective_scope(&self.viewer, requested);
        let (generation, page) = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            let page = if scope != state.scope { 1 } else { page.max(1) };
            (state.generation, page)
        };

        let spec = resolver::resolve(&self.viewer, scope, page, self.options.page_size);
        debug!(
            requested = requested.as_str(),
            scope = spec.scope.as_str(),
            page,
            generation,
            key = %spec.cache_key(),
            "loading feed window"
        );

        let fetched = self.fetch_window(&spec).await;
        let (window, from_cache) = match fetched {
            Ok(found) => found,
            Err(error) => {
                if self.is_current(generation).await {
                    warn!(scope = scope.as_str(), page, error = %error, "feed load failed");
                    self.emit(FeedEvent::LoadFailed { scope, page, error: error.clone() });
                    return Err(error);
                }
                return Ok(LoadOutcome::Superseded);
            }
        };

        let cards = self.decorate(window.posts).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(generation, current = state.generation, "dropping superseded feed response");
            return Ok(LoadOutcome::Superseded);
        }
        state.scope = scope;
        state.page = page;
        state.cards = cards.clone();
        state.total = window.total;
        drop(state);

        if cards.is_empty() {
            self.emit(FeedEvent::Empty { scope, page });
            return Ok(LoadOutcome::Empty { scope, page });
        }
        self.emit(FeedEvent::Loaded { scope, page, cards: cards.clone(), total: window.total });
        Ok(LoadOutcome::Loaded(FeedPage { scope, page, cards, total: window.total, from_cache }))
    }

    pub async fn switch_scope(&self, scope: Scope) -> Result<LoadOutcome> {
        self.load_feed(scope, 1).await
    }

    /// Drops the cached copy of the current window and reloads it.
    pub async fn refresh(&self) -> Result<LoadOutcome> {
        let (scope, page) = {
            let state = self.state.lock().await;
            (state.scope, state.page)
        };
        let spec = resolver::resolve(&self.viewer, scope, page, self.options.page_size);
        self.cache.invalidate(&spec.cache_key()).await;
        self.load_feed(scope, page).await
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state.lock().await.generation == generation
    }

    async fn fetch_window(&self, spec: &QuerySpec) -> Result<(CachedWindow, bool)> {
        let key = spec.cache_key();
        if let Some(window) = self.cache.get::<CachedWindow>(&key).await {
            return Ok((window, true));
        }

        // A write confirmed while the select is in flight makes this window stale.
        let epoch = self.cache.epoch();
        let page = self
            .gateway
            .select(Table::Posts, &spec.to_select())
            .await
            .map_err(|e| AppError::remote("load feed", e))?;
        let window = CachedWindow { posts: interactions::decode_listed(page.rows), total: page.total };
        self.cache.put_unless_invalidated(&key, &window, self.options.cache_ttl, epoch).await;
        Ok((window, false))
    }

    /// Attaches the viewer's like/favorite flags. A failed flag lookup leaves
    /// the flags unset rather than failing the whole load.
    async fn decorate(&self, posts: Vec<Post>) -> Vec<PostCard> {
        let (liked, favorited) = match self.viewer.user_id() {
            Some(user_id) => {
                let ids: Vec<Uuid> = posts.iter().map(|p| p.id).collect();
                (
                    self.reacted(Reaction::Like, user_id, &ids).await,
                    self.reacted(Reaction::Favorite, user_id, &ids).await,
                )
            }
            None => (HashSet::new(), HashSet::new()),
        };

        let now = self.clock.now();
        posts
            .into_iter()
            .map(|post| {
                let primary_badge = match (&post.author, post.anonymous) {
                    (Some(author), false) => author.primary_badge(now).cloned(),
                    _ => None,
                };
                PostCard {
                    liked: liked.contains(&post.id),
                    favorited: favorited.contains(&post.id),
                    primary_badge,
                    post,
                }
            })
            .collect()
    }

    async fn reacted(&self, reaction: Reaction, user_id: Uuid, ids: &[Uuid]) -> HashSet<Uuid> {
        match interactions::reacted_posts(self.gateway.as_ref(), reaction, user_id, ids).await {
            Ok(found) => found.into_iter().collect(),
            Err(e) => {
                warn!(action = reaction.action(), error = %e, "could not load viewer reactions");
                HashSet::new()
            }
        }
    }

    // ── Optimistic toggles ──────────────────────────────────────────────────

    pub async fn apply_like(&self, post_id: Uuid) -> Result<()> {
        self.set_reaction(Reaction::Like, post_id, true).await
    }

    pub async fn unapply_like(&self, post_id: Uuid) -> Result<()> {
        self.set_reaction(Reaction::Like, post_id, false).await
    }

    pub async fn apply_favorite(&self, post_id: Uuid) -> Result<()> {
        self.set_reaction(Reaction::Favorite, post_id, true).await
    }

    pub async fn unapply_favorite(&self, post_id: Uuid) -> Result<()> {
        self.set_reaction(Reaction::Favorite, post_id, false).await
    }

    /// Flips the current state; returns the state the viewer asked for.
    pub async fn toggle(&self, reaction: Reaction, post_id: Uuid) -> Result<bool> {
        let current = {
            let state = self.state.lock().await;
            let card = find_card(&state.cards, post_id)?;
            match reaction {
                Reaction::Like => card.liked,
                Reaction::Favorite => card.favorited,
            }
        };
        self.set_reaction(reaction, post_id, !current).await?;
        Ok(!current)
    }

    fn require_user(&self, action: &'static str) -> Result<Uuid> {
        match self.viewer.user_id() {
            Some(id) => Ok(id),
            None => {
                self.emit(FeedEvent::LoginRequired { action });
                Err(AppError::NotAuthenticated(format!("sign in to {action}")))
            }
        }
    }

    async fn set_reaction(&self, reaction: Reaction, post_id: Uuid, on: bool) -> Result<()> {
        let user_id = self.require_user(reaction.action())?;

        // Apply locally first, remembering exactly what we overwrote.
        let before = {
            let mut state = self.state.lock().await;
            let card = find_card_mut(&mut state.cards, post_id)?;
            let before = card.clone();
            let flag = match reaction {
                Reaction::Like => &mut card.liked,
                Reaction::Favorite => &mut card.favorited,
            };
            if *flag == on {
                return Ok(());
            }
            *flag = on;
            if reaction == Reaction::Like {
                card.post.like_count = if on {
                    card.post.like_count.saturating_add(1)
                } else {
                    card.post.like_count.saturating_sub(1)
                };
            }
            self.emit(FeedEvent::PostUpdated(card.clone()));
            before
        };

        let written =
            interactions::write_reaction(self.gateway.as_ref(), reaction, user_id, post_id, on, self.clock.now()).await;

        match written {
            Ok(()) => {
                info!(action = reaction.action(), %post_id, on, "reaction confirmed");
                self.cache.invalidate_prefix(FEED_CACHE_PREFIX).await;
                Ok(())
            }
            Err(error) => {
                warn!(action = reaction.action(), %post_id, error = %error, "reaction failed, rolling back");
                let restored = {
                    let mut state = self.state.lock().await;
                    match find_card_mut(&mut state.cards, post_id) {
                        Ok(card) => {
                            match reaction {
                                Reaction::Like => {
                                    card.liked = before.liked;
                                    card.post.like_count = before.post.like_count;
                                }
                                Reaction::Favorite => card.favorited = before.favorited,
                            }
                            Some(card.clone())
                        }
                        // The feed was replaced meanwhile; nothing on screen to undo.
                        Err(_) => None,
                    }
                };
                self.emit(FeedEvent::MutationRolledBack { post_id, card: restored, error: error.clone() });
                Err(error)
            }
        }
    }

    // ── Comments ────────────────────────────────────────────────────────────

    /// Creates a comment remotely, then bumps the displayed counter by one.
    /// A second submission for the same post is refused while one is in flight.
    pub async fn append_comment(&self, post_id: Uuid, content: &str) -> Result<Comment> {
        let user_id = self.require_user("comment")?;
        cb_core::validation::validate_comment(content)?;
        let _ticket = self.comments_in_flight.try_acquire(post_id.to_string())?;

        let comment = interactions::create_comment(self.gateway.as_ref(), user_id, post_id, content.trim()).await?;
        info!(%post_id, comment_id = %comment.id, "comment created");

        {
            let mut state = self.state.lock().await;
            if let Ok(card) = find_card_mut(&mut state.cards, post_id) {
                card.post.comment_count = card.post.comment_count.saturating_add(1);
                self.emit(FeedEvent::PostUpdated(card.clone()));
            }
        }
        self.emit(FeedEvent::CommentAdded { post_id, comment: comment.clone() });
        self.cache.invalidate_prefix(FEED_CACHE_PREFIX).await;
        Ok(comment)
    }
}

fn find_card(cards: &[PostCard], post_id: Uuid) -> Result<&PostCard> {
    cards
        .iter()
        .find(|c| c.post.id == post_id)
        .ok_or_else(|| AppError::NotFound("Post".into(), post_id.to_string()))
}

fn find_card_mut(cards: &mut [PostCard], post_id: Uuid) -> Result<&mut PostCard> {
    cards
        .iter_mut()
        .find(|c| c.post.id == post_id)
        .ok_or_else(|| AppError::NotFound("Post".into(), post_id.to_string()))
}
