//! # Query model
//!
//! Backend-neutral description of a table read: filter predicate, ordering,
//! range window and embedded relations. Adapters translate it into their own
//! dialect; the in-memory adapter evaluates it with [`Filter::matches`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw row as it crosses the gateway boundary.
pub type Row = serde_json::Map<String, Value>;

/// Tables consumed from the hosted backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Posts,
    Comments,
    Badges,
    UserBadges,
    Likes,
    CommentLikes,
    Favorites,
    Reports,
    Drafts,
    PostImages,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Profiles,
        Table::Posts,
        Table::Comments,
        Table::Badges,
        Table::UserBadges,
        Table::Likes,
        Table::CommentLikes,
        Table::Favorites,
        Table::Reports,
        Table::Drafts,
        Table::PostImages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Posts => "posts",
            Table::Comments => "comments",
            Table::Badges => "badges",
            Table::UserBadges => "user_badges",
            Table::Likes => "likes",
            Table::CommentLikes => "comment_likes",
            Table::Favorites => "favorites",
            Table::Reports => "reports",
            Table::Drafts => "drafts",
            Table::PostImages => "post_images",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row predicate. Columns may be dotted paths into embedded relations
/// (e.g. `author.community`).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn in_list<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), f) => {
                left.push(f);
                Filter::Or(left)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    /// Evaluates the predicate against a row. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, expected) => {
                lookup(row, column).is_some_and(|actual| actual == expected)
            }
            Filter::In(column, candidates) => {
                lookup(row, column).is_some_and(|actual| candidates.contains(actual))
            }
            Filter::And(parts) => parts.iter().all(|f| f.matches(row)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(row)),
        }
    }
}

fn lookup<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = row.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::Null => None,
        v => Some(v),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    pub fn desc(column: &str) -> Self {
        Self { column: column.to_string(), descending: true }
    }

    pub fn asc(column: &str) -> Self {
        Self { column: column.to_string(), descending: false }
    }
}

/// Offset/limit window. A zero limit asks for the total count only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
}

/// How an embedded relation hangs off the parent row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedKind {
    /// Many-to-one: `parent[local_key] == child.id`, embedded as an object.
    One { local_key: String },
    /// One-to-many: `child[foreign_key] == parent.id`, embedded as an array.
    Many { foreign_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    /// Field name the relation is embedded under.
    pub alias: String,
    pub table: Table,
    pub kind: EmbedKind,
    /// Relations embedded inside each related row.
    pub embeds: Vec<Embed>,
}

impl Embed {
    pub fn one(alias: &str, table: Table, local_key: &str) -> Self {
        Self {
            alias: alias.to_string(),
            table,
            kind: EmbedKind::One { local_key: local_key.to_string() },
            embeds: vec![],
        }
    }

    pub fn many(alias: &str, table: Table, foreign_key: &str) -> Self {
        Self {
            alias: alias.to_string(),
            table,
            kind: EmbedKind::Many { foreign_key: foreign_key.to_string() },
            embeds: vec![],
        }
    }

    pub fn with(mut self, child: Embed) -> Self {
        self.embeds.push(child);
        self
    }
}

/// A complete read request against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub filter: Filter,
    pub order: Option<Order>,
    pub range: Option<Range>,
    pub embeds: Vec<Embed>,
}

impl Select {
    pub fn new(filter: Filter) -> Self {
        Self { filter, order: None, range: None, embeds: vec![] }
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn range(mut self, offset: u64, limit: u64) -> Self {
        self.range = Some(Range { offset, limit });
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }
}

/// Rows returned by a select plus the exact count of matching rows
/// before the range window was applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Row>,
    pub total: u64,
}
