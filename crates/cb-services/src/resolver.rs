//! # Visibility & scope resolver
//!
//! Pure function from (viewer, requested scope, page) to the feed query.
//!
//! Community scope is an OR: every `global` post plus the `community` posts
//! whose author shares the viewer's community. Global posts always appear,
//! whichever scope the viewer picked.

use cb_core::{Embed, Filter, Order, Range, Scope, Select, Table, Viewer, Visibility};
use cb_core::PostStatus;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// The resolved feed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Scope actually applied; `Global` whenever community scope was
    /// requested but could not be honoured.
    pub scope: Scope,
    /// Community the predicate was built for, if any.
    pub community: Option<String>,
    pub predicate: Filter,
    pub order: Order,
    pub range: Range,
}

impl QuerySpec {
    pub fn to_select(&self) -> Select {
        Select::new(self.predicate.clone())
            .order(self.order.clone())
            .range(self.range.offset, self.range.limit)
            .embed(author_embed())
    }

    /// Cache key identifying this exact window of this exact predicate.
    pub fn cache_key(&self) -> String {
        format!(
            "feed:{}:{}:{}:{}",
            self.scope.as_str(),
            self.community.as_deref().unwrap_or("-"),
            self.range.offset,
            self.range.limit
        )
    }
}

/// The author's profile with each award and its badge, enough to show the
/// primary badge next to the name.
pub fn author_embed() -> Embed {
    Embed::one("author", Table::Profiles, "author_id")
        .with(Embed::many("badges", Table::UserBadges, "user_id").with(Embed::one("badge", Table::Badges, "badge_id")))
}

/// The scope a request for `scope` is actually served under.
pub fn effective_scope(viewer: &Viewer, scope: Scope) -> Scope {
    match scope {
        Scope::OwnCommunity if viewer.community().is_some() => Scope::OwnCommunity,
        _ => Scope::Global,
    }
}

fn global_only() -> Filter {
    Filter::eq("visibility", Visibility::Global.as_str())
}

fn own_community(community: &str) -> Filter {
    global_only().or(
        Filter::eq("visibility", Visibility::Community.as_str())
            .and(Filter::eq("author.community", community)),
    )
}

/// Builds the feed query. `page` is 1-indexed; 0 is treated as 1, and a
/// zero `page_size` falls back to [`DEFAULT_PAGE_SIZE`].
pub fn resolve(viewer: &Viewer, scope: Scope, page: u32, page_size: u32) -> QuerySpec {
    let page = page.max(1);
    let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };

    // Anonymous viewers and unresolved communities silently fall back to global.
    let community = match effective_scope(viewer, scope) {
        Scope::OwnCommunity => viewer.community().map(str::to_string),
        Scope::Global => None,
    };

    let (scope, visibility) = match &community {
        Some(c) => (Scope::OwnCommunity, own_community(c)),
        None => (Scope::Global, global_only()),
    };

    QuerySpec {
        scope,
        community,
        predicate: Filter::eq("status", PostStatus::Published.as_str()).and(visibility),
        order: Order::desc("created_at"),
        range: Range {
            offset: u64::from(page - 1) * u64::from(page_size),
            limit: u64::from(page_size),
        },
    }
}
