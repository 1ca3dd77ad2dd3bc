#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use listing_sync::db;
use listing_sync::model::{ListingDraft, SourceConfig};
use listing_sync::schema::presets;
use listing_sync::upstream::{CheckResponse, ListPage, MarketApi, UpstreamError};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Single-connection in-memory store with migrations applied.
pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn preset(slug: &str) -> SourceConfig {
    presets()
        .unwrap()
        .into_iter()
        .find(|s| s.slug == slug)
        .unwrap()
}

/// Save the steam preset and return it with its id.
pub async fn saved_steam(pool: &sqlx::SqlitePool) -> SourceConfig {
    db::save_source(pool, &preset("steam")).await.unwrap()
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    base + ChronoDuration::seconds(offset_secs)
}

pub fn item(item_id: i64, price: f64) -> Value {
    json!({
        "item_id": item_id,
        "title": format!("Account {item_id}"),
        "price": price,
        "currency": "usd",
        "steam_level": item_id % 50,
    })
}

pub fn draft(source_id: i64, item_id: i64, title: &str, price: Option<f64>) -> ListingDraft {
    ListingDraft {
        source_id,
        item_id,
        url: format!("https://prod-api.lzt.market/{item_id}/"),
        title: title.to_string(),
        price,
        currency: Some("usd".into()),
        extension: Map::new(),
        score: None,
        raw_payload: json!({ "item_id": item_id }),
        seen_at: at(0),
    }
}

pub fn page(items: Vec<Value>, has_next: bool) -> Result<ListPage, UpstreamError> {
    Ok(ListPage {
        items,
        has_next_page: has_next,
        total_items: None,
    })
}

pub fn live() -> Result<CheckResponse, UpstreamError> {
    Ok(CheckResponse {
        status: 200,
        body: Some(json!({ "item": { "item_state": "active" } })),
    })
}

pub fn state(item_state: &str) -> Result<CheckResponse, UpstreamError> {
    Ok(CheckResponse {
        status: 200,
        body: Some(json!({ "item": { "item_state": item_state } })),
    })
}

pub fn status(code: u16) -> Result<CheckResponse, UpstreamError> {
    Ok(CheckResponse {
        status: code,
        body: None,
    })
}

/// Scripted marketplace. Search pages are served in order and an exhausted
/// script answers with an empty last page. Checks are scripted per item and
/// default to "active".
#[derive(Clone, Default)]
pub struct FakeMarket {
    pages: Arc<Mutex<VecDeque<Result<ListPage, UpstreamError>>>>,
    checks: Arc<Mutex<HashMap<i64, VecDeque<Result<CheckResponse, UpstreamError>>>>>,
    list_calls: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    check_calls: Arc<Mutex<Vec<i64>>>,
    check_delay: Option<Duration>,
    endless: bool,
}

impl FakeMarket {
    pub fn with_pages(pages: Vec<Result<ListPage, UpstreamError>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(VecDeque::from(pages))),
            ..Default::default()
        }
    }

    /// Every page returns one item and claims there is another page.
    pub fn endless() -> Self {
        Self {
            endless: true,
            ..Default::default()
        }
    }

    pub fn slow_checks(delay: Duration) -> Self {
        Self {
            check_delay: Some(delay),
            ..Default::default()
        }
    }

    pub async fn script_check(
        &self,
        item_id: i64,
        answers: Vec<Result<CheckResponse, UpstreamError>>,
    ) {
        self.checks
            .lock()
            .await
            .insert(item_id, VecDeque::from(answers));
    }

    pub async fn list_calls(&self) -> Vec<Vec<(String, String)>> {
        self.list_calls.lock().await.clone()
    }

    pub async fn check_calls(&self) -> Vec<i64> {
        let mut calls = self.check_calls.lock().await.clone();
        calls.sort_unstable();
        calls
    }
}

#[async_trait]
impl MarketApi for FakeMarket {
    async fn list_page(
        &self,
        _source: &SourceConfig,
        page: u32,
        params: &[(String, String)],
    ) -> Result<ListPage, UpstreamError> {
        self.list_calls.lock().await.push(params.to_vec());
        if self.endless {
            return Ok(ListPage {
                items: vec![item(i64::from(page), 10.0)],
                has_next_page: true,
                total_items: None,
            });
        }
        self.pages
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(page_empty)
    }

    async fn check_item(
        &self,
        _source: &SourceConfig,
        item_id: i64,
    ) -> Result<CheckResponse, UpstreamError> {
        self.check_calls.lock().await.push(item_id);
        if let Some(delay) = self.check_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .checks
            .lock()
            .await
            .get_mut(&item_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(live)
    }
}

fn page_empty() -> Result<ListPage, UpstreamError> {
    page(Vec::new(), false)
}

pub fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
