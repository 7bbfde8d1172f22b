//! Single-post view: the post, its images and comments, and the viewer's
//! interactions with them.

use std::collections::HashSet;
use std::sync::Arc;

use cb_core::validation::validate_comment;
use cb_core::{
    decode_rows, encode_row, AppError, Clock, Comment, DataGateway, Embed, Filter, Post, Report, ReportStatus,
    Result, Select, Table, Viewer,
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ExpiringCache;
use crate::feed::FEED_CACHE_PREFIX;
use crate::guard::SubmitGuard;
use crate::interactions::{self, Reaction};
use crate::resolver::author_embed;

#[derive(Debug, Clone, PartialEq)]
pub struct CommentView {
    pub comment: Comment,
    pub liked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostDetail {
    pub post: Post,
    pub liked: bool,
    pub favorited: bool,
    /// Newest first.
    pub comments: Vec<CommentView>,
}

pub struct PostDetailService {
    gateway: Arc<dyn DataGateway>,
    cache: Arc<ExpiringCache>,
    clock: Arc<dyn Clock>,
    viewer: Viewer,
    state: Mutex<Option<PostDetail>>,
    submitting: SubmitGuard,
}

impl PostDetailService {
    pub fn new(gateway: Arc<dyn DataGateway>, cache: Arc<ExpiringCache>, clock: Arc<dyn Clock>, viewer: Viewer) -> Self {
        Self { gateway, cache, clock, viewer, state: Mutex::new(None), submitting: SubmitGuard::new() }
    }

    pub async fn current(&self) -> Option<PostDetail> {
        self.state.lock().await.clone()
    }

    pub async fn load(&self, post_id: Uuid) -> Result<PostDetail> {
        let select = Select::new(Filter::eq("id", post_id.to_string()))
            .range(0, 1)
            .embed(author_embed())
            .embed(Embed::many("images", Table::PostImages, "post_id"));
        let page = self
            .gateway
            .select(Table::Posts, &select)
            .await
            .map_err(|e| AppError::remote("load post", e))?;
        let post = decode_rows::<Post>(page.rows)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound("Post".into(), post_id.to_string()))?;

        let comments = interactions::load_comments(self.gateway.as_ref(), post_id).await?;

        let (liked, favorited, liked_comments) = match self.viewer.user_id() {
            Some(user_id) => {
                let comment_ids: Vec<Uuid> = comments.iter().map(|c| c.id).collect();
                (
                    self.has_reacted(Reaction::Like, user_id, post_id).await,
                    self.has_reacted(Reaction::Favorite, user_id, post_id).await,
                    interactions::liked_comments(self.gateway.as_ref(), user_id, &comment_ids)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(%post_id, error = %e, "could not load comment likes");
                            vec![]
                        })
                        .into_iter()
                        .collect::<HashSet<_>>(),
                )
            }
            None => (false, false, HashSet::new()),
        };

        let detail = PostDetail {
            post,
            liked,
            favorited,
            comments: comments
                .into_iter()
                .map(|comment| CommentView { liked: liked_comments.contains(&comment.id), comment })
                .collect(),
        };
        *self.state.lock().await = Some(detail.clone());
        Ok(detail)
    }

    async fn has_reacted(&self, reaction: Reaction, user_id: Uuid, post_id: Uuid) -> bool {
        match interactions::reacted_posts(self.gateway.as_ref(), reaction, user_id, &[post_id]).await {
            Ok(ids) => ids.contains(&post_id),
            Err(e) => {
                warn!(%post_id, action = reaction.action(), error = %e, "could not load viewer reaction");
                false
            }
        }
    }

    fn require_user(&self, action: &str) -> Result<Uuid> {
        self.viewer
            .user_id()
            .ok_or_else(|| AppError::NotAuthenticated(format!("sign in to {action}")))
    }

    /// Flips like or favorite on the loaded post; reverts on failure.
    pub async fn toggle(&self, reaction: Reaction) -> Result<PostDetail> {
        let user_id = self.require_user(reaction.action())?;

        let (post_id, on, before) = {
            let mut state = self.state.lock().await;
            let detail = state.as_mut().ok_or_else(not_loaded)?;
            let before = detail.clone();
            let on = match reaction {
                Reaction::Like => {
                    detail.liked = !detail.liked;
                    detail.post.like_count = if detail.liked {
                        detail.post.like_count.saturating_add(1)
                    } else {
                        detail.post.like_count.saturating_sub(1)
                    };
                    detail.liked
                }
                Reaction::Favorite => {
                    detail.favorited = !detail.favorited;
                    detail.favorited
                }
            };
            (detail.post.id, on, before)
        };

        let written =
            interactions::write_reaction(self.gateway.as_ref(), reaction, user_id, post_id, on, self.clock.now()).await;
        match written {
            Ok(()) => {
                self.cache.invalidate_prefix(FEED_CACHE_PREFIX).await;
                self.current().await.ok_or_else(not_loaded)
            }
            Err(e) => {
                warn!(%post_id, action = reaction.action(), error = %e, "reverting");
                let mut state = self.state.lock().await;
                if let Some(detail) = state.as_mut().filter(|d| d.post.id == post_id) {
                    detail.liked = before.liked;
                    detail.favorited = before.favorited;
                    detail.post.like_count = before.post.like_count;
                }
                Err(e)
            }
        }
    }

    /// Flips the viewer's like on one comment; reverts on failure.
    pub async fn toggle_comment_like(&self, comment_id: Uuid) -> Result<CommentView> {
        let user_id = self.require_user("like")?;

        let (before, after) = {
            let mut state = self.state.lock().await;
            let view = find_comment(state.as_mut().ok_or_else(not_loaded)?, comment_id)?;
            let before = view.clone();
            view.liked = !view.liked;
            view.comment.like_count = if view.liked {
                view.comment.like_count.saturating_add(1)
            } else {
                view.comment.like_count.saturating_sub(1)
            };
            (before, view.clone())
        };

        let written =
            interactions::write_comment_like(self.gateway.as_ref(), user_id, comment_id, after.liked, self.clock.now())
                .await;
        // Another post may have been loaded meanwhile; then there is nothing on screen to update.
        let mut state = self.state.lock().await;
        let view = state.as_mut().and_then(|detail| find_comment(detail, comment_id).ok());
        match written {
            Ok(()) => Ok(view.map_or(after, |view| view.clone())),
            Err(e) => {
                warn!(%comment_id, error = %e, "comment like failed, reverting");
                if let Some(view) = view {
                    *view = before;
                }
                Err(e)
            }
        }
    }

    pub async fn add_comment(&self, content: &str) -> Result<Comment> {
        let user_id = self.require_user("comment")?;
        validate_comment(content)?;
        let post_id = self.current().await.ok_or_else(not_loaded)?.post.id;
        let _ticket = self.submitting.try_acquire(format!("comment:{post_id}"))?;

        let comment = interactions::create_comment(self.gateway.as_ref(), user_id, post_id, content.trim()).await?;
        if let Some(detail) = self.state.lock().await.as_mut() {
            detail.comments.insert(0, CommentView { comment: comment.clone(), liked: false });
            detail.post.comment_count = detail.post.comment_count.saturating_add(1);
        }
        self.cache.invalidate_prefix(FEED_CACHE_PREFIX).await;
        Ok(comment)
    }

    /// Files a report against the loaded post for moderators.
    pub async fn report(&self, reasons: &[&str], description: &str) -> Result<Report> {
        let reporter_id = self.require_user("report")?;
        let reasons: Vec<&str> = reasons.iter().map(|r| r.trim()).filter(|r| !r.is_empty()).collect();
        if reasons.is_empty() {
            return Err(AppError::ValidationFailed("choose at least one reason".into()));
        }
        let post_id = self.current().await.ok_or_else(not_loaded)?.post.id;
        let _ticket = self.submitting.try_acquire(format!("report:{post_id}"))?;

        let report = Report {
            post_id,
            reporter_id,
            reason: reasons.join(","),
            description: description.trim().to_string(),
            status: ReportStatus::Pending,
        };
        self.gateway
            .insert(Table::Reports, vec![encode_row(&report)?])
            .await
            .map_err(|e| AppError::remote("submit report", e))?;
        info!(%post_id, %reporter_id, "report filed");
        Ok(report)
    }
}

fn not_loaded() -> AppError {
    AppError::NotFound("Post".into(), "(none loaded)".into())
}

fn find_comment(detail: &mut PostDetail, comment_id: Uuid) -> Result<&mut CommentView> {
    detail
        .comments
        .iter_mut()
        .find(|c| c.comment.id == comment_id)
        .ok_or_else(|| AppError::NotFound("Comment".into(), comment_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_gateway_memory::{ManualClock, MemoryGateway, MemoryKeyValueStore};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        gateway: Arc<MemoryGateway>,
        clock: Arc<ManualClock>,
        author: Uuid,
        post_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let gateway = Arc::new(MemoryGateway::new());
        let clock = Arc::new(ManualClock::starting_now());
        let author = Uuid::now_v7();
        let post_id = Uuid::now_v7();
        gateway
            .seed(Table::Profiles, json!({ "id": author, "username": "dana", "community": "north" }))
            .await;
        gateway
            .seed(
                Table::Posts,
                json!({
                    "id": post_id, "author_id": author, "title": "Bike for sale", "body": "Red, 3 gears",
                    "category": "marketplace", "visibility": "global", "status": "published",
                    "price": 40.0, "created_at": clock.now(), "like_count": 1, "comment_count": 2,
                }),
            )
            .await;
        gateway
            .seed(Table::PostImages, json!({ "post_id": post_id, "image_url": "https://cdn.test/bike.jpg" }))
            .await;
        for (i, text) in ["is it still available?", "what size?"].iter().enumerate() {
            gateway
                .seed(
                    Table::Comments,
                    json!({
                        "id": Uuid::now_v7(), "post_id": post_id, "author_id": author, "content": text,
                        "created_at": clock.now() + Duration::minutes(i as i64),
                    }),
                )
                .await;
        }
        Fixture { gateway, clock, author, post_id }
    }

    fn service(fx: &Fixture, viewer: Viewer) -> PostDetailService {
        let cache = Arc::new(ExpiringCache::new(Arc::new(MemoryKeyValueStore::new()), fx.clock.clone()));
        PostDetailService::new(fx.gateway.clone(), cache, fx.clock.clone(), viewer)
    }

    fn signed_in(fx: &Fixture) -> Viewer {
        Viewer::Authenticated { user_id: fx.author, community: Some("north".into()) }
    }

    #[tokio::test]
    async fn test_load_embeds_author_images_and_comments() {
        let fx = fixture().await;
        let detail = service(&fx, Viewer::Anonymous).load(fx.post_id).await.unwrap();

        assert_eq!(detail.post.author.as_ref().map(|a| a.username.as_str()), Some("dana"));
        assert_eq!(detail.post.images.len(), 1);
        assert_eq!(detail.post.price, Some(40.0));
        let contents: Vec<_> = detail.comments.iter().map(|c| c.comment.content.as_str()).collect();
        assert_eq!(contents, vec!["what size?", "is it still available?"]);
    }

    #[tokio::test]
    async fn test_missing_post_is_not_found() {
        let fx = fixture().await;
        let err = service(&fx, Viewer::Anonymous).load(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(..)));
    }

    #[tokio::test]
    async fn test_comment_like_reverts_on_failure() {
        let fx = fixture().await;
        let detail_service = service(&fx, signed_in(&fx));
        let detail = detail_service.load(fx.post_id).await.unwrap();
        let comment_id = detail.comments[0].comment.id;

        let view = detail_service.toggle_comment_like(comment_id).await.unwrap();
        assert!(view.liked);
        assert_eq!(view.comment.like_count, 1);

        fx.gateway.set_unavailable(Table::CommentLikes, true);
        assert!(detail_service.toggle_comment_like(comment_id).await.is_err());
        let current = detail_service.current().await.unwrap();
        assert!(current.comments[0].liked);
        assert_eq!(current.comments[0].comment.like_count, 1);
    }

    #[tokio::test]
    async fn test_favorite_then_reload_sees_it() {
        let fx = fixture().await;
        let detail_service = service(&fx, signed_in(&fx));
        detail_service.load(fx.post_id).await.unwrap();

        assert!(detail_service.toggle(Reaction::Favorite).await.unwrap().favorited);
        assert!(detail_service.load(fx.post_id).await.unwrap().favorited);
    }

    #[tokio::test]
    async fn test_new_comment_goes_on_top() {
        let fx = fixture().await;
        let detail_service = service(&fx, signed_in(&fx));
        detail_service.load(fx.post_id).await.unwrap();

        detail_service.add_comment("I'll take it").await.unwrap();
        let current = detail_service.current().await.unwrap();
        assert_eq!(current.comments[0].comment.content, "I'll take it");
        assert_eq!(current.post.comment_count, 3);
    }

    #[tokio::test]
    async fn test_report_requires_reason_and_sign_in() {
        let fx = fixture().await;
        let anonymous = service(&fx, Viewer::Anonymous);
        anonymous.load(fx.post_id).await.unwrap();
        assert!(matches!(anonymous.report(&["spam"], "").await, Err(AppError::NotAuthenticated(_))));

        let member = service(&fx, signed_in(&fx));
        member.load(fx.post_id).await.unwrap();
        assert!(matches!(member.report(&[" "], "").await, Err(AppError::ValidationFailed(_))));

        let report = member.report(&["spam", "fraud"], " duplicate listing ").await.unwrap();
        assert_eq!(report.reason, "spam,fraud");
        assert_eq!(report.description, "duplicate listing");
        assert_eq!(fx.gateway.rows(Table::Reports).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_comment_is_left_out() {
        let fx = fixture().await;
        // No content column: the row cannot be decoded.
        fx.gateway
            .seed(
                Table::Comments,
                json!({ "id": Uuid::now_v7(), "post_id": fx.post_id, "author_id": fx.author, "created_at": fx.clock.now() }),
            )
            .await;

        let detail = service(&fx, Viewer::Anonymous).load(fx.post_id).await.unwrap();
        assert_eq!(detail.comments.len(), 2);
    }

    #[tokio::test]
    async fn test_comment_like_lands_after_switching_posts() {
        let fx = fixture().await;
        let other = Uuid::now_v7();
        fx.gateway
            .seed(
                Table::Posts,
                json!({
                    "id": other, "author_id": fx.author, "title": "Lost umbrella", "body": "Black, near gym",
                    "category": "lost_and_found", "visibility": "global", "status": "published",
                    "created_at": fx.clock.now(),
                }),
            )
            .await;
        let detail_service = service(&fx, signed_in(&fx));
        let comment_id = detail_service.load(fx.post_id).await.unwrap().comments[0].comment.id;

        let held = fx.gateway.hold_next(Table::CommentLikes);
        let (liked, switched) = tokio::join!(detail_service.toggle_comment_like(comment_id), async {
            held.reached().await;
            let switched = detail_service.load(other).await;
            held.release();
            switched
        });

        let view = liked.unwrap();
        assert!(view.liked);
        assert_eq!(view.comment.like_count, 1);
        assert_eq!(switched.unwrap().post.id, other);
        assert_eq!(fx.gateway.rows(Table::CommentLikes).await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_report_while_first_in_flight_conflicts() {
        let fx = fixture().await;
        let member = service(&fx, signed_in(&fx));
        member.load(fx.post_id).await.unwrap();

        let held = fx.gateway.hold_next(Table::Reports);
        let (first, second) = tokio::join!(member.report(&["spam"], ""), async {
            held.reached().await;
            let second = member.report(&["spam"], "again").await;
            held.release();
            second
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(AppError::Conflict(_))));
        assert_eq!(fx.gateway.rows(Table::Reports).await.len(), 1);
        // The guard is released once the first report settles.
        assert!(member.report(&["spam"], "").await.is_ok());
    }

    #[tokio::test]
    async fn test_author_badge_comes_with_the_post() {
        let fx = fixture().await;
        let badge_id = Uuid::now_v7();
        fx.gateway
            .seed(
                Table::Badges,
                json!({
                    "id": badge_id, "name": "Campus Pioneer", "description": "early", "is_permanent": true,
                    "level": 1, "icon_url": "https://picsum.photos/id/67/40/40",
                }),
            )
            .await;
        fx.gateway
            .seed(
                Table::UserBadges,
                json!({ "user_id": fx.author, "badge_id": badge_id, "obtained_at": fx.clock.now(), "expires_at": null }),
            )
            .await;

        let detail = service(&fx, Viewer::Anonymous).load(fx.post_id).await.unwrap();
        let author = detail.post.author.unwrap();
        assert_eq!(author.primary_badge(fx.clock.now()).map(|b| b.name.as_str()), Some("Campus Pioneer"));
    }
}
