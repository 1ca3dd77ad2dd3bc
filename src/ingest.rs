//! Ingestion worker: page through the marketplace search and upsert what it returns.
//!
//! Pages are fetched strictly in order. Every page gets its own run log row,
//! so a failure on page N leaves pages 1..N-1 stored and audited. A failed page
//! ends the run; only rate limiting is retried.
use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{
    FilterState, IngestionRun, ListingDraft, RunStatus, RunSummary, SourceConfig, WorkerKind,
};
use crate::scoring::{self, Scorer};
use crate::upstream::{self, BackoffPolicy, MarketApi};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Pause after each successful page before requesting the next one.
    pub page_pause: Duration,
    pub backoff: BackoffPolicy,
}

impl IngestOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            page_pause: cfg.page_pause(),
            backoff: BackoffPolicy::from_config(cfg),
        }
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            page_pause: Duration::from_millis(1000),
            backoff: BackoffPolicy::default(),
        }
    }
}

struct PageOutcome {
    fetched: u64,
    stored: u64,
    has_next: bool,
}

struct Pass<'a> {
    pool: &'a Pool,
    api: &'a dyn MarketApi,
    scorer: &'a dyn Scorer,
    source: &'a SourceConfig,
    source_id: i64,
    filters: &'a FilterState,
    backoff: BackoffPolicy,
}

/// Run one ingestion pass for `source`.
#[instrument(skip_all, fields(source = %source.slug))]
pub async fn run(
    pool: &Pool,
    api: &dyn MarketApi,
    scorer: &dyn Scorer,
    source: &SourceConfig,
    filters: &FilterState,
    opts: &IngestOptions,
) -> Result<RunSummary> {
    let source_id = source.require_id()?;
    let pass = Pass {
        pool,
        api,
        scorer,
        source,
        source_id,
        filters,
        backoff: opts.backoff,
    };
    let clock = Instant::now();
    let mut summary = RunSummary::new(WorkerKind::Ingestion, source_id);
    let mut page: u32 = 1;

    loop {
        let started_at = Utc::now();
        let page_clock = Instant::now();
        let outcome = pass.ingest_page(page).await;

        let (status, items_fetched, error_message) = match &outcome {
            Ok(o) => (RunStatus::Success, o.fetched, None),
            Err(err) => (RunStatus::Error, 0, Some(format!("{err:#}"))),
        };
        db::record_ingestion_page(
            pool,
            &IngestionRun {
                id: Uuid::new_v4().to_string(),
                source_id,
                started_at,
                page: i64::from(page),
                items_fetched: items_fetched as i64,
                status,
                error_message: error_message.clone(),
                duration_ms: page_clock.elapsed().as_millis() as i64,
            },
        )
        .await
        .context("writing ingestion run log")?;
        summary.pages += 1;

        let Ok(outcome) = outcome else {
            error!(
                page,
                error = error_message.as_deref().unwrap_or_default(),
                "ingestion page failed; stopping run"
            );
            summary.status = RunStatus::Error;
            summary.error = error_message;
            break;
        };
        summary.items_fetched += outcome.fetched;
        info!(
            page,
            fetched = outcome.fetched,
            stored = outcome.stored,
            has_next = outcome.has_next,
            "ingested page"
        );

        if !outcome.has_next {
            break;
        }
        if let Some(limit) = source.fetch_page_limit {
            if page >= limit {
                info!(page, limit, "page limit reached");
                break;
            }
        }
        tokio::time::sleep(opts.page_pause).await;
        page += 1;
    }

    if summary.status == RunStatus::InProgress {
        summary.status = RunStatus::Success;
    }
    summary.duration_ms = clock.elapsed().as_millis() as i64;
    info!(
        pages = summary.pages,
        items = summary.items_fetched,
        status = summary.status.as_str(),
        "ingestion finished"
    );
    Ok(summary)
}

impl Pass<'_> {
    async fn ingest_page(&self, page: u32) -> Result<PageOutcome> {
        let params = upstream::build_list_params(self.source, page, self.filters);
        let body = upstream::retry_rate_limited(&self.backoff, || {
            self.api.list_page(self.source, page, &params)
        })
        .await
        .with_context(|| format!("fetching page {page}"))?;

        let seen_at = Utc::now();
        let mut drafts = Vec::with_capacity(body.items.len());
        for item in &body.items {
            let Some(mut draft) = build_draft(self.source, self.source_id, item, seen_at) else {
                warn!(page, "skipping item without a usable item_id");
                continue;
            };
            draft.score = scoring::score_or_none(self.scorer, &draft, self.source).await;
            drafts.push(draft);
        }
        let stored = db::upsert_listings(self.pool, &drafts).await?;

        Ok(PageOutcome {
            fetched: body.items.len() as u64,
            stored,
            has_next: body.has_next_page,
        })
    }
}

/// Turn one raw search item into a listing candidate. Returns `None` when the
/// item has no integer id.
pub fn build_draft(
    source: &SourceConfig,
    source_id: i64,
    item: &Value,
    seen_at: DateTime<Utc>,
) -> Option<ListingDraft> {
    let item_id = item.get("item_id").and_then(as_i64)?;
    let mut extension = Map::new();
    for column in source.extension_columns() {
        let Some(value) = item.get(&column.id).filter(|v| !v.is_null()) else {
            continue;
        };
        let value = if column.is_numeric {
            numeric_value(value).unwrap_or_else(|| value.clone())
        } else {
            value.clone()
        };
        extension.insert(column.id.clone(), value);
    }

    Some(ListingDraft {
        source_id,
        item_id,
        url: format!("{}/{}/", source.base_url.trim_end_matches('/'), item_id),
        title: item
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        price: item.get("price").and_then(as_f64),
        currency: item
            .get("currency")
            .and_then(Value::as_str)
            .map(str::to_string),
        extension,
        score: None,
        raw_payload: item.clone(),
        seen_at,
    })
}

/// Numeric columns are stored as JSON numbers so they sort and compare numerically.
fn numeric_value(value: &Value) -> Option<Value> {
    let n = as_f64(value)?;
    if n.fract() == 0.0 && n.abs() < 9e15 {
        Some(Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::presets;
    use serde_json::json;

    fn steam() -> SourceConfig {
        let mut s = presets()
            .unwrap()
            .into_iter()
            .find(|s| s.slug == "steam")
            .unwrap();
        s.id = Some(1);
        s
    }

    #[test]
    fn draft_copies_core_and_extension_fields() {
        let item = json!({
            "item_id": 123,
            "title": "Prime account",
            "price": "12.5",
            "currency": "usd",
            "steam_level": "17",
            "steam_balance": "$3",
            "not_a_column": true,
        });
        let draft = build_draft(&steam(), 1, &item, Utc::now()).unwrap();
        assert_eq!(draft.item_id, 123);
        assert_eq!(draft.url, "https://prod-api.lzt.market/123/");
        assert_eq!(draft.price, Some(12.5));
        assert_eq!(draft.currency.as_deref(), Some("usd"));
        assert_eq!(draft.extension.get("steam_level"), Some(&json!(17)));
        assert_eq!(draft.extension.get("steam_balance"), Some(&json!("$3")));
        assert!(!draft.extension.contains_key("not_a_column"));
        assert_eq!(draft.raw_payload, item);
    }

    #[test]
    fn draft_requires_item_id() {
        assert!(build_draft(&steam(), 1, &json!({ "title": "x" }), Utc::now()).is_none());
        assert!(build_draft(&steam(), 1, &json!({ "item_id": "abc" }), Utc::now()).is_none());
        assert!(build_draft(&steam(), 1, &json!({ "item_id": "77" }), Utc::now()).is_some());
    }
}
