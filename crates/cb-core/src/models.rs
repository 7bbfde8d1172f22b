//! # Domain Models
//!
//! Typed records for every row shape the client reads from or writes to the
//! hosted backend. Rows are decoded into these at the gateway boundary; no
//! component past that point handles loosely-shaped data.

use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::query::{Row, Table};

/// Who is looking at the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    Anonymous,
    Authenticated {
        user_id: Uuid,
        /// `None` when the profile lookup missed or failed.
        community: Option<String>,
    },
}

impl Viewer {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Viewer::Anonymous => None,
            Viewer::Authenticated { user_id, .. } => Some(*user_id),
        }
    }

    pub fn community(&self) -> Option<&str> {
        match self {
            Viewer::Anonymous => None,
            Viewer::Authenticated { community, .. } => community.as_deref(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Viewer::Authenticated { .. })
    }
}

/// The identity the backend reports for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
}

/// Feed filter mode requested by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    OwnCommunity,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::OwnCommunity => "own_community",
            Scope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ConfessionWall,
    LostAndFound,
    Social,
    Marketplace,
    Announcement,
    OpenDiscussion,
}

/// A post's own declared audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Community,
    Global,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Community => "community",
            Visibility::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    PendingReview,
    Published,
    Rejected,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::PendingReview => "pending_review",
            PostStatus::Published => "published",
            PostStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    /// The school the viewer registered under
    pub community: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Present only when the read embedded the profile's awards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub badges: Vec<UserBadge>,
}

impl Profile {
    /// The earliest award still in force, the one shown next to the name.
    pub fn primary_badge(&self, now: DateTime<Utc>) -> Option<&Badge> {
        self.badges
            .iter()
            .filter(|award| award.expires_at.map_or(true, |at| at > now))
            .filter_map(|award| award.badge.as_ref().map(|badge| (award.obtained_at, badge)))
            .min_by_key(|(obtained_at, _)| *obtained_at)
            .map(|(_, badge)| badge)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub body: String,
    pub category: Category,
    pub visibility: Visibility,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub comment_count: u32,
    /// Embedded author profile, when the query asked for it
    #[serde(default)]
    pub author: Option<Profile>,
    #[serde(default)]
    pub images: Vec<PostImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub author: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Badge {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_permanent: bool,
    pub level: i32,
    pub icon_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBadge {
    pub user_id: Uuid,
    pub badge_id: Uuid,
    pub obtained_at: DateTime<Utc>,
    /// `None` for permanent badges
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<Badge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostImage {
    pub post_id: Uuid,
    pub image_url: String,
}

/// Join row shared by `likes` and `favorites`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostReaction {
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentLike {
    pub user_id: Uuid,
    pub comment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub post_id: Uuid,
    pub reporter_id: Uuid,
    /// Comma-joined reason codes
    pub reason: String,
    pub description: String,
    pub status: ReportStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub author_id: Uuid,
    pub title: String,
    pub body: String,
    pub category: Category,
    pub visibility: Visibility,
    pub anonymous: bool,
    pub price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ── Insert shapes ────────────────────────────────────────────────────────────
// Server-assigned columns (id, created_at, counters) are left out.

#[derive(Debug, Clone, Serialize)]
pub struct NewProfile {
    pub id: Uuid,
    pub username: String,
    pub community: String,
    pub grade: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPost {
    pub author_id: Uuid,
    pub title: String,
    pub body: String,
    pub category: Category,
    pub visibility: Visibility,
    pub status: PostStatus,
    pub price: Option<f64>,
    pub anonymous: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewComment {
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewBadge {
    pub name: String,
    pub description: String,
    pub is_permanent: bool,
    pub level: i32,
    pub icon_url: String,
}

/// A table-backed record that can be decoded from a gateway row.
pub trait Record: DeserializeOwned {
    const TABLE: Table;

    /// Cross-field invariants the type system cannot express.
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl Record for Profile {
    const TABLE: Table = Table::Profiles;
}

impl Record for Post {
    const TABLE: Table = Table::Posts;

    fn check(&self) -> std::result::Result<(), String> {
        match (self.category, self.price) {
            (Category::Marketplace, None) => Err(format!("marketplace post {} has no price", self.id)),
            (c, Some(_)) if c != Category::Marketplace => {
                Err(format!("non-marketplace post {} carries a price", self.id))
            }
            _ => Ok(()),
        }
    }
}

impl Record for Comment {
    const TABLE: Table = Table::Comments;
}

impl Record for Badge {
    const TABLE: Table = Table::Badges;
}

impl Record for UserBadge {
    const TABLE: Table = Table::UserBadges;
}

impl Record for PostImage {
    const TABLE: Table = Table::PostImages;
}

impl Record for PostReaction {
    // Also used for `favorites`; the table is chosen by the caller on writes.
    const TABLE: Table = Table::Likes;
}

impl Record for CommentLike {
    const TABLE: Table = Table::CommentLikes;
}

impl Record for Report {
    const TABLE: Table = Table::Reports;
}

impl Record for Draft {
    const TABLE: Table = Table::Drafts;
}

/// Decodes gateway rows into typed records, rejecting malformed shapes.
pub fn decode_rows<T: Record>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

pub fn decode_row<T: Record>(row: Row) -> Result<T> {
    let record: T = serde_json::from_value(serde_json::Value::Object(row))
        .map_err(|e| AppError::RemoteFailed(format!("malformed {} row: {e}", T::TABLE)))?;
    record
        .check()
        .map_err(|e| AppError::RemoteFailed(format!("invalid {} row: {e}", T::TABLE)))?;
    Ok(record)
}

/// Encodes an insert shape as a gateway row.
pub fn encode_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(AppError::ValidationFailed(format!("expected an object row, got {other}"))),
        Err(e) => Err(AppError::ValidationFailed(format!("unencodable row: {e}"))),
    }
}

/// Short human label for how long ago something happened.
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - at).num_minutes().max(0);
    let hours = minutes / 60;
    let days = hours / 24;

    if minutes < 60 {
        format!("{minutes} minutes ago")
    } else if hours < 24 {
        format!("{hours} hours ago")
    } else if days < 30 {
        format!("{days} days ago")
    } else {
        format!("{}/{}", at.month(), at.day())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn post_row(category: &str, price: serde_json::Value) -> Row {
        json!({
            "id": Uuid::now_v7(),
            "author_id": Uuid::now_v7(),
            "title": "Desk lamp",
            "body": "Barely used",
            "category": category,
            "visibility": "global",
            "status": "published",
            "created_at": "2025-03-01T10:00:00Z",
            "price": price,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_marketplace_post_requires_price() {
        assert!(decode_row::<Post>(post_row("marketplace", json!(12.5))).is_ok());
        let err = decode_row::<Post>(post_row("marketplace", json!(null))).unwrap_err();
        assert!(matches!(err, AppError::RemoteFailed(_)));
    }

    #[test]
    fn test_price_outside_marketplace_is_rejected() {
        assert!(decode_row::<Post>(post_row("social", json!(null))).is_ok());
        assert!(decode_row::<Post>(post_row("social", json!(3.0))).is_err());
    }

    #[test]
    fn test_unknown_category_is_remote_failure() {
        let err = decode_row::<Post>(post_row("gossip", json!(null))).unwrap_err();
        assert!(err.to_string().contains("malformed posts row"));
    }

    #[test]
    fn test_relative_time_buckets() {
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
        assert_eq!(relative_time(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_time(now - Duration::days(2), now), "2 days ago");
        assert_eq!(relative_time(now - Duration::days(45), now), "5/16");
    }

    #[test]
    fn test_viewer_accessors() {
        let id = Uuid::now_v7();
        let v = Viewer::Authenticated { user_id: id, community: None };
        assert_eq!(v.user_id(), Some(id));
        assert_eq!(v.community(), None);
        assert!(!Viewer::Anonymous.is_authenticated());
    }

    #[test]
    fn test_primary_badge_is_earliest_unexpired_award() {
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
        let award = |name: &str, days_ago: i64, expires_at: Option<DateTime<Utc>>| {
            json!({
                "user_id": Uuid::nil(),
                "badge_id": Uuid::nil(),
                "obtained_at": now - Duration::days(days_ago),
                "expires_at": expires_at,
                "badge": {
                    "id": Uuid::nil(), "name": name, "description": "", "is_permanent": expires_at.is_none(),
                    "level": 1, "icon_url": "",
                },
            })
        };
        let row = json!({
            "id": Uuid::now_v7(),
            "username": "mei",
            "community": "north",
            "badges": [
                award("Campus Pioneer", 3, None),
                award("Night Owl", 9, Some(now - Duration::days(1))),
                award("Platform Pioneer", 5, None),
            ],
        });
        let profile = decode_row::<Profile>(row.as_object().cloned().unwrap()).unwrap();
        assert_eq!(profile.primary_badge(now).map(|b| b.name.as_str()), Some("Platform Pioneer"));

        let bare = Profile { badges: vec![], ..profile };
        assert_eq!(bare.primary_badge(now), None);
    }
}
