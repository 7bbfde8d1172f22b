//! Renders the backend-neutral query model into PostgREST query parameters.

use cb_core::{Embed, EmbedKind, Filter, Select};
use serde_json::Value;

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Values inside `in.(...)` and logic trees are quoted when they could be
/// mistaken for syntax.
fn render_quoted(value: &Value) -> String {
    let raw = render_value(value);
    if raw.contains([',', '(', ')', '"', ' ', '.']) {
        format!("\"{}\"", raw.replace('"', "\\\""))
    } else {
        raw
    }
}

fn render_list(values: &[Value]) -> String {
    values.iter().map(render_quoted).collect::<Vec<_>>().join(",")
}

/// Logic-tree form used inside `or=(...)`: `col.eq.v`, `and(a,b)`.
fn render_tree(filter: &Filter) -> Option<String> {
    match filter {
        Filter::All => None,
        Filter::Eq(column, value) => Some(format!("{column}.eq.{}", render_quoted(value))),
        Filter::In(column, values) => Some(format!("{column}.in.({})", render_list(values))),
        Filter::And(parts) => Some(format!("and({})", join_tree(parts))),
        Filter::Or(parts) => Some(format!("or({})", join_tree(parts))),
    }
}

fn join_tree(parts: &[Filter]) -> String {
    parts.iter().filter_map(render_tree).collect::<Vec<_>>().join(",")
}

/// Top-level filter parameters. A top-level AND becomes one parameter per
/// conjunct, which PostgREST ANDs together.
pub fn render_filter(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::All => vec![],
        Filter::Eq(column, value) => vec![(column.clone(), format!("eq.{}", render_value(value)))],
        Filter::In(column, values) => vec![(column.clone(), format!("in.({})", render_list(values)))],
        Filter::And(parts) => parts.iter().flat_map(render_filter).collect(),
        Filter::Or(parts) => vec![("or".into(), format!("({})", join_tree(parts)))],
    }
}

fn mentions(filter: &Filter, alias: &str) -> bool {
    let prefix = format!("{alias}.");
    match filter {
        Filter::All => false,
        Filter::Eq(column, _) | Filter::In(column, _) => column.starts_with(&prefix),
        Filter::And(parts) | Filter::Or(parts) => parts.iter().any(|p| mentions(p, alias)),
    }
}

/// `alias:table!hint(*,...)`, with nested relations rendered inside the parens.
fn render_embed(embed: &Embed, join: &str) -> String {
    let hint = match &embed.kind {
        EmbedKind::One { local_key } => local_key,
        EmbedKind::Many { foreign_key } => foreign_key,
    };
    let mut columns = vec!["*".to_string()];
    columns.extend(embed.embeds.iter().map(|child| render_embed(child, "")));
    format!("{}:{}!{}{}({})", embed.alias, embed.table, hint, join, columns.join(","))
}

/// Full parameter list for a read: `select`, filters, `order`, `offset`/`limit`.
pub fn render_select(query: &Select) -> Vec<(String, String)> {
    let mut columns = vec!["*".to_string()];
    for embed in &query.embeds {
        // Filtering through an embed needs an inner join to drop parent rows.
        let join = if mentions(&query.filter, &embed.alias) { "!inner" } else { "" };
        columns.push(render_embed(embed, join));
    }

    let mut params = vec![("select".to_string(), columns.join(","))];
    params.extend(render_filter(&query.filter));
    if let Some(order) = &query.order {
        let direction = if order.descending { "desc" } else { "asc" };
        params.push(("order".into(), format!("{}.{direction}", order.column)));
    }
    if let Some(range) = query.range {
        params.push(("offset".into(), range.offset.to_string()));
        params.push(("limit".into(), range.limit.to_string()));
    }
    params
}

/// Total from a `Content-Range` header such as `0-9/42` or `*/0`.
pub fn parse_total(content_range: &str) -> Option<u64> {
    content_range.rsplit_once('/')?.1.trim().parse().ok()
}
