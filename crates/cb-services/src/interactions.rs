//! Remote writes shared by the feed and the post detail view.

use cb_core::{
    decode_row, encode_row, AppError, Comment, CommentLike, DataGateway, Embed, Filter, NewComment,
    PostReaction, Record, Result, Row, Select, Table,
};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// Which per-post toggle a viewer is flipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Like,
    Favorite,
}

impl Reaction {
    pub fn table(&self) -> Table {
        match self {
            Reaction::Like => Table::Likes,
            Reaction::Favorite => Table::Favorites,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Reaction::Like => "like",
            Reaction::Favorite => "favorite",
        }
    }
}

/// Inserts or deletes the viewer's reaction row for a post.
pub async fn write_reaction(
    gateway: &dyn DataGateway,
    reaction: Reaction,
    user_id: Uuid,
    post_id: Uuid,
    on: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    if on {
        let row = encode_row(&PostReaction { user_id, post_id, created_at: now })?;
        gateway
            .insert(reaction.table(), vec![row])
            .await
            .map_err(|e| AppError::remote(reaction.action(), e))?;
    } else {
        let filter = Filter::eq("user_id", user_id.to_string()).and(Filter::eq("post_id", post_id.to_string()));
        gateway
            .delete(reaction.table(), &filter)
            .await
            .map_err(|e| AppError::remote(reaction.action(), e))?;
    }
    Ok(())
}

pub async fn write_comment_like(
    gateway: &dyn DataGateway,
    user_id: Uuid,
    comment_id: Uuid,
    on: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    if on {
        let row = encode_row(&CommentLike { user_id, comment_id, created_at: now })?;
        gateway
            .insert(Table::CommentLikes, vec![row])
            .await
            .map_err(|e| AppError::remote("comment like", e))?;
    } else {
        let filter =
            Filter::eq("user_id", user_id.to_string()).and(Filter::eq("comment_id", comment_id.to_string()));
        gateway
            .delete(Table::CommentLikes, &filter)
            .await
            .map_err(|e| AppError::remote("comment like", e))?;
    }
    Ok(())
}

/// Creates a comment server-side and returns it with its real identifier.
pub async fn create_comment(
    gateway: &dyn DataGateway,
    author_id: Uuid,
    post_id: Uuid,
    content: &str,
) -> Result<Comment> {
    let row = encode_row(&NewComment { post_id, author_id, content: content.to_string() })?;
    let inserted = gateway
        .insert(Table::Comments, vec![row])
        .await
        .map_err(|e| AppError::remote("add comment", e))?;
    let row = inserted
        .into_iter()
        .next()
        .ok_or_else(|| AppError::RemoteFailed("add comment: backend returned no row".into()))?;
    decode_row(row)
}

/// Ids among `post_ids` the user has a `reaction` row for.
pub async fn reacted_posts(
    gateway: &dyn DataGateway,
    reaction: Reaction,
    user_id: Uuid,
    post_ids: &[Uuid],
) -> Result<Vec<Uuid>> {
    if post_ids.is_empty() {
        return Ok(vec![]);
    }
    let filter = Filter::eq("user_id", user_id.to_string())
        .and(Filter::in_list("post_id", post_ids.iter().map(|id| id.to_string())));
    let page = gateway
        .select(reaction.table(), &Select::new(filter))
        .await
        .map_err(|e| AppError::remote(reaction.action(), e))?;
    let rows: Vec<PostReaction> = decode_listed(page.rows);
    Ok(rows.into_iter().map(|r| r.post_id).collect())
}

pub async fn liked_comments(gateway: &dyn DataGateway, user_id: Uuid, comment_ids: &[Uuid]) -> Result<Vec<Uuid>> {
    if comment_ids.is_empty() {
        return Ok(vec![]);
    }
    let filter = Filter::eq("user_id", user_id.to_string())
        .and(Filter::in_list("comment_id", comment_ids.iter().map(|id| id.to_string())));
    let page = gateway
        .select(Table::CommentLikes, &Select::new(filter))
        .await
        .map_err(|e| AppError::remote("comment likes", e))?;
    let rows: Vec<CommentLike> = decode_listed(page.rows);
    Ok(rows.into_iter().map(|r| r.comment_id).collect())
}

/// Comments of a post, newest first, with their authors embedded.
pub async fn load_comments(gateway: &dyn DataGateway, post_id: Uuid) -> Result<Vec<Comment>> {
    let select = Select::new(Filter::eq("post_id", post_id.to_string()))
        .order(cb_core::Order::desc("created_at"))
        .embed(Embed::one("author", Table::Profiles, "author_id"));
    let page = gateway
        .select(Table::Comments, &select)
        .await
        .map_err(|e| AppError::remote("load comments", e))?;
    Ok(decode_listed(page.rows))
}

/// Decodes a list read row by row. One bad row is logged and left out
/// instead of failing the whole list.
pub fn decode_listed<T: Record>(rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.get("id").cloned();
            match decode_row::<T>(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(table = %T::TABLE, id = ?id, error = %e, "skipping unreadable row");
                    None
                }
            }
        })
        .collect()
}
