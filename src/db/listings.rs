use super::Pool;
use crate::model::{Listing, ListingDraft, View, ViewCounts};
use crate::query::{Condition, FieldRef, SortOrder, StorePredicate};
use crate::schema::CoreField;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, instrument};

// Stays well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

const LISTING_COLUMNS: &str = "source_id, item_id, url, title, price, currency, extension_data, \
     score, is_hidden, is_archived, archived_reason, archived_at, first_seen_at, last_seen_at, \
     raw_payload";

/// One page of a filtered listing query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingPage {
    pub items: Vec<Listing>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Fields a user action or the reconciliation worker may change. `None`
/// leaves the column alone; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPatch {
    pub is_hidden: Option<bool>,
    pub is_archived: Option<bool>,
    pub archived_reason: Option<Option<String>>,
    pub archived_at: Option<Option<DateTime<Utc>>>,
}

impl ListingPatch {
    pub fn hide() -> Self {
        Self {
            is_hidden: Some(true),
            ..Default::default()
        }
    }

    pub fn unhide() -> Self {
        Self {
            is_hidden: Some(false),
            ..Default::default()
        }
    }

    pub fn archive(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            is_archived: Some(true),
            archived_reason: Some(Some(reason.into())),
            archived_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn unarchive() -> Self {
        Self {
            is_archived: Some(false),
            archived_reason: Some(None),
            archived_at: Some(None),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_hidden.is_none()
            && self.is_archived.is_none()
            && self.archived_reason.is_none()
            && self.archived_at.is_none()
    }
}

/// Lowercased text of the fields a `Contains` filter can target, as
/// `{"core": {..}, "ext": {..}}`. Folding happens here because SQLite's
/// `LOWER()` leaves non-ASCII letters alone. The url is not folded: it never
/// changes after the first insert, so a copy taken from a later draft would drift.
fn search_text(draft: &ListingDraft) -> Value {
    let mut core = Map::new();
    core.insert("title".into(), Value::String(draft.title.to_lowercase()));
    if let Some(currency) = &draft.currency {
        core.insert("currency".into(), Value::String(currency.to_lowercase()));
    }
    let ext: Map<String, Value> = draft
        .extension
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s.to_lowercase(),
                other => other.to_string().to_lowercase(),
            };
            Some((key.clone(), Value::String(text)))
        })
        .collect();
    let mut folded = Map::new();
    folded.insert("core".into(), Value::Object(core));
    folded.insert("ext".into(), Value::Object(ext));
    Value::Object(folded)
}

/// Path of a field's folded copy inside `search_text`, if it has one.
fn search_path(field: &FieldRef) -> Option<String> {
    match field {
        FieldRef::Core(CoreField::Title) => Some("$.core.title".into()),
        FieldRef::Core(CoreField::Currency) => Some("$.core.currency".into()),
        FieldRef::Core(_) => None,
        FieldRef::Extension(key) => Some(format!("$.ext.{}", quoted_key(key))),
    }
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    let item_id: i64 = row.try_get("item_id")?;
    let extension_raw: String = row.try_get("extension_data")?;
    let payload_raw: String = row.try_get("raw_payload")?;
    Ok(Listing {
        source_id: row.try_get("source_id")?,
        item_id,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        extension: serde_json::from_str::<Map<String, Value>>(&extension_raw)
            .with_context(|| format!("listing {item_id}: malformed extension_data"))?,
        score: row.try_get("score")?,
        is_hidden: row.try_get("is_hidden")?,
        is_archived: row.try_get("is_archived")?,
        archived_reason: row.try_get("archived_reason")?,
        archived_at: row.try_get("archived_at")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        raw_payload: serde_json::from_str(&payload_raw)
            .with_context(|| format!("listing {item_id}: malformed raw_payload"))?,
    })
}

/// Insert new listings or refresh existing ones.
///
/// On conflict only content and freshness columns are overwritten. Visibility,
/// archival state and `first_seen_at` belong to users and reconciliation and
/// are never touched here.
#[instrument(skip_all, fields(count = drafts.len()))]
pub async fn upsert_listings(pool: &Pool, drafts: &[ListingDraft]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut written = 0;
    for draft in drafts {
        let extension = serde_json::to_string(&draft.extension)?;
        let payload = serde_json::to_string(&draft.raw_payload)?;
        let folded = serde_json::to_string(&search_text(draft))?;
        let result = sqlx::query(
            "INSERT INTO listings (source_id, item_id, url, title, price, currency, \
             extension_data, search_text, score, raw_payload, first_seen_at, last_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(source_id, item_id) DO UPDATE SET \
             title = excluded.title, price = excluded.price, currency = excluded.currency, \
             extension_data = excluded.extension_data, search_text = excluded.search_text, \
             score = excluded.score, raw_payload = excluded.raw_payload, \
             last_seen_at = excluded.last_seen_at",
        )
        .bind(draft.source_id)
        .bind(draft.item_id)
        .bind(&draft.url)
        .bind(&draft.title)
        .bind(draft.price)
        .bind(&draft.currency)
        .bind(&extension)
        .bind(&folded)
        .bind(draft.score)
        .bind(&payload)
        .bind(draft.seen_at)
        .bind(draft.seen_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upserting item {}", draft.item_id))?;
        written += result.rows_affected();
    }
    tx.commit().await?;
    Ok(written)
}

fn push_field(qb: &mut QueryBuilder<'_, Sqlite>, field: &FieldRef) {
    match field {
        FieldRef::Core(core) => {
            qb.push(core.column());
        }
        FieldRef::Extension(key) => {
            qb.push("json_extract(extension_data, ");
            qb.push_bind(json_path(key));
            qb.push(")");
        }
    }
}

fn quoted_key(key: &str) -> String {
    format!("\"{}\"", key.replace('"', "\\\""))
}

fn json_path(key: &str) -> String {
    format!("$.{}", quoted_key(key))
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_view(qb: &mut QueryBuilder<'_, Sqlite>, view: View) {
    qb.push(match view {
        View::Active => " AND is_hidden = 0 AND is_archived = 0",
        View::Hidden => " AND is_hidden = 1 AND is_archived = 0",
        View::Archived => " AND is_archived = 1",
    });
}

fn push_predicate(qb: &mut QueryBuilder<'_, Sqlite>, predicate: &StorePredicate) {
    for clause in &predicate.clauses {
        qb.push(" AND ");
        match &clause.condition {
            Condition::Contains(needle) => {
                // Rows written before search_text existed fall back to ASCII folding.
                let path = search_path(&clause.field);
                if let Some(path) = &path {
                    qb.push("COALESCE(json_extract(search_text, ");
                    qb.push_bind(path.clone());
                    qb.push("), ");
                }
                qb.push("LOWER(CAST(");
                push_field(qb, &clause.field);
                qb.push(" AS TEXT))");
                if path.is_some() {
                    qb.push(")");
                }
                qb.push(" LIKE ");
                qb.push_bind(like_pattern(needle));
                qb.push(" ESCAPE '\\'");
            }
            Condition::AtLeast(n) => {
                qb.push("CAST(");
                push_field(qb, &clause.field);
                qb.push(" AS REAL) >= ");
                qb.push_bind(*n);
            }
            Condition::AtMost(n) => {
                qb.push("CAST(");
                push_field(qb, &clause.field);
                qb.push(" AS REAL) <= ");
                qb.push_bind(*n);
            }
            Condition::EqualsNumber(n) => {
                qb.push("CAST(");
                push_field(qb, &clause.field);
                qb.push(" AS REAL) = ");
                qb.push_bind(*n);
            }
            Condition::EqualsText(value) => {
                qb.push("CAST(");
                push_field(qb, &clause.field);
                qb.push(" AS TEXT) = ");
                qb.push_bind(value.clone());
            }
        }
    }
}

fn push_where(
    qb: &mut QueryBuilder<'_, Sqlite>,
    source_id: i64,
    view: View,
    predicate: &StorePredicate,
) {
    qb.push(" WHERE source_id = ");
    qb.push_bind(source_id);
    push_view(qb, view);
    push_predicate(qb, predicate);
}

/// Filtered, sorted, paginated read for one view of a source. `page` is 1-based.
/// Nulls sort last in either direction; `item_id` breaks ties.
#[instrument(skip_all, fields(source_id = source_id, view = view.as_str()))]
pub async fn query_listings(
    pool: &Pool,
    source_id: i64,
    view: View,
    predicate: &StorePredicate,
    sort: &SortOrder,
    page: u32,
    page_size: u32,
) -> Result<ListingPage> {
    let page = page.max(1);
    let page_size = page_size.max(1);

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM listings");
    push_where(&mut count, source_id, view, predicate);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {LISTING_COLUMNS} FROM listings"));
    push_where(&mut qb, source_id, view, predicate);
    qb.push(" ORDER BY (");
    push_field(&mut qb, &sort.field);
    qb.push(") IS NULL, ");
    push_field(&mut qb, &sort.field);
    qb.push(if sort.ascending { " ASC" } else { " DESC" });
    qb.push(", item_id ASC LIMIT ");
    qb.push_bind(i64::from(page_size));
    qb.push(" OFFSET ");
    qb.push_bind(i64::from(page - 1) * i64::from(page_size));

    let rows = qb.build().fetch_all(pool).await?;
    let items = rows.iter().map(listing_from_row).collect::<Result<Vec<_>>>()?;
    debug!(total, returned = items.len(), "listing query");
    Ok(ListingPage {
        items,
        total,
        page,
        page_size,
    })
}

/// Every item id in a view that matches the predicate, for "select all" bulk actions.
#[instrument(skip_all, fields(source_id = source_id))]
pub async fn listing_ids_matching(
    pool: &Pool,
    source_id: i64,
    view: View,
    predicate: &StorePredicate,
) -> Result<Vec<i64>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT item_id FROM listings");
    push_where(&mut qb, source_id, view, predicate);
    qb.push(" ORDER BY item_id ASC");
    Ok(qb.build_query_scalar().fetch_all(pool).await?)
}

#[instrument(skip_all, fields(source_id = source_id, count = ids.len()))]
pub async fn find_by_ids(pool: &Pool, source_id: i64, ids: &[i64]) -> Result<Vec<Listing>> {
    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE source_id = "
        ));
        qb.push_bind(source_id);
        push_id_list(&mut qb, chunk);
        qb.push(" ORDER BY item_id ASC");
        let rows = qb.build().fetch_all(pool).await?;
        for row in &rows {
            found.push(listing_from_row(row)?);
        }
    }
    Ok(found)
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    qb.push(" AND item_id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

/// Keyset page of non-archived listings with `item_id > cursor`, ascending.
/// Hidden listings are included: hiding is a display choice and does not
/// exempt a listing from liveness checks.
#[instrument(skip_all, fields(source_id = source_id, cursor = cursor))]
pub async fn scan_active_after(
    pool: &Pool,
    source_id: i64,
    cursor: i64,
    limit: u32,
) -> Result<Vec<Listing>> {
    let rows = sqlx::query(&format!(
        "SELECT {LISTING_COLUMNS} FROM listings \
         WHERE source_id = ? AND is_archived = 0 AND item_id > ? \
         ORDER BY item_id ASC LIMIT ?"
    ))
    .bind(source_id)
    .bind(cursor)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(listing_from_row).collect()
}

/// Apply `patch` to the given items of one source. Returns rows changed.
#[instrument(skip_all, fields(source_id = source_id, count = ids.len()))]
pub async fn bulk_update(
    pool: &Pool,
    source_id: i64,
    ids: &[i64],
    patch: &ListingPatch,
) -> Result<u64> {
    if ids.is_empty() || patch.is_empty() {
        return Ok(0);
    }
    let mut changed = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE listings SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(hidden) = patch.is_hidden {
                set.push("is_hidden = ").push_bind_unseparated(hidden);
            }
            if let Some(archived) = patch.is_archived {
                set.push("is_archived = ").push_bind_unseparated(archived);
            }
            if let Some(reason) = &patch.archived_reason {
                set.push("archived_reason = ")
                    .push_bind_unseparated(reason.clone());
            }
            if let Some(at) = patch.archived_at {
                set.push("archived_at = ").push_bind_unseparated(at);
            }
        }
        qb.push(" WHERE source_id = ");
        qb.push_bind(source_id);
        push_id_list(&mut qb, chunk);
        changed += qb.build().execute(pool).await?.rows_affected();
    }
    Ok(changed)
}

#[instrument(skip_all, fields(source_id = source_id))]
pub async fn counts(pool: &Pool, source_id: i64) -> Result<ViewCounts> {
    let row = sqlx::query(
        "SELECT \
         COALESCE(SUM(CASE WHEN is_hidden = 0 AND is_archived = 0 THEN 1 ELSE 0 END), 0) \
         AS active, \
         COALESCE(SUM(CASE WHEN is_hidden = 1 AND is_archived = 0 THEN 1 ELSE 0 END), 0) \
         AS hidden, \
         COALESCE(SUM(CASE WHEN is_archived = 1 THEN 1 ELSE 0 END), 0) AS archived \
         FROM listings WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok(ViewCounts {
        active: row.try_get("active")?,
        hidden: row.try_get("hidden")?,
        archived: row.try_get("archived")?,
    })
}
