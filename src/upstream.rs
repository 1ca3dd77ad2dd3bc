//! Marketplace API client: paginated listing search and per-item status checks.
use crate::config::Config;
use crate::model::{FilterState, SourceConfig};
use crate::query;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const TOKEN_ENV: &str = "LZT_API_TOKEN";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    #[error("marketplace API token is not configured (set upstream.token or LZT_API_TOKEN)")]
    MissingToken,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid upstream response: {0}")]
    Decode(String),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
}

/// One page of search results.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPage {
    pub items: Vec<Value>,
    pub has_next_page: bool,
    pub total_items: Option<i64>,
}

/// Raw answer of the per-item status endpoint. `body` is only parsed for 200s.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResponse {
    pub status: u16,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Live { reason: String },
    Stale { reason: String },
}

#[async_trait]
pub trait MarketApi: Send + Sync {
    /// Fetch one search page. `params` is the full query, see [`build_list_params`].
    async fn list_page(
        &self,
        source: &SourceConfig,
        page: u32,
        params: &[(String, String)],
    ) -> Result<ListPage, UpstreamError>;

    /// Ask the status endpoint about one item. HTTP 429 is an error; every
    /// other status is returned for [`classify_check`] to judge.
    async fn check_item(
        &self,
        source: &SourceConfig,
        item_id: i64,
    ) -> Result<CheckResponse, UpstreamError>;
}

/// API token holder passed explicitly to the client. The configured token
/// wins; otherwise `LZT_API_TOKEN` is read on first use and cached until
/// [`Credentials::invalidate`].
pub struct Credentials {
    configured: String,
    cached: RwLock<Option<String>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(configured: impl Into<String>) -> Self {
        Self {
            configured: configured.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn token(&self) -> Result<String, UpstreamError> {
        if let Some(token) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(token);
        }
        let resolved = if self.configured.trim().is_empty() {
            std::env::var(TOKEN_ENV).unwrap_or_default()
        } else {
            self.configured.clone()
        };
        let resolved = resolved.trim().to_string();
        if resolved.is_empty() {
            return Err(UpstreamError::MissingToken);
        }
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(resolved.clone());
        Ok(resolved)
    }

    /// Drop the cached token so the next call resolves it again.
    pub fn invalidate(&self) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Exponential backoff for rate-limited calls, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.upstream.max_retries,
            base_delay: Duration::from_millis(cfg.upstream.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.upstream.backoff_max_ms),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying only [`UpstreamError::RateLimited`] up to
/// `policy.max_retries` times. A server-supplied `Retry-After` is honoured
/// but never exceeds `max_delay`.
pub async fn retry_rate_limited<T, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(UpstreamError::RateLimited { retry_after }) if attempt < policy.max_retries => {
                let delay = retry_after
                    .map(|d| d.min(policy.max_delay))
                    .unwrap_or_else(|| policy.delay_for_attempt(attempt));
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited by upstream, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Full search query for one page: `page`, the source's default filters, then
/// the caller's filters mapped through each filter's `param_name*`.
pub fn build_list_params(
    source: &SourceConfig,
    page: u32,
    filters: &FilterState,
) -> Vec<(String, String)> {
    let mut params = vec![("page".to_string(), page.to_string())];
    params.extend(
        source
            .default_filters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    params.extend(query::upstream_params(source, filters));
    params
}

pub fn check_path(source: &SourceConfig, item_id: i64) -> String {
    source
        .check_path_template
        .replace("{id}", &item_id.to_string())
}

/// Decide whether a status check says the item is gone. Only an explicit
/// terminal state or a 404 counts as stale; anything ambiguous is live.
pub fn classify_check(response: &CheckResponse) -> ItemStatus {
    match response.status {
        200 => {
            let state = response
                .body
                .as_ref()
                .and_then(|body| body.get("item"))
                .and_then(|item| item.get("item_state"))
                .and_then(Value::as_str);
            match state {
                Some("paid") => ItemStatus::Stale {
                    reason: "Item has been sold.".into(),
                },
                Some(s @ ("deleted" | "closed")) => ItemStatus::Stale {
                    reason: format!("Item state is '{s}'."),
                },
                _ => ItemStatus::Live {
                    reason: "Item is active.".into(),
                },
            }
        }
        404 => ItemStatus::Stale {
            reason: "Item not found (404).".into(),
        },
        other => ItemStatus::Live {
            reason: format!("Unexpected status: {other}"),
        },
    }
}

fn join_url(base_url: &str, path: &str) -> Result<Url, UpstreamError> {
    let raw = format!("{}{}", base_url.trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| UpstreamError::InvalidUrl(format!("{raw}: {e}")))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Clone)]
pub struct HttpMarketApi {
    http: Client,
    credentials: Arc<Credentials>,
}

impl fmt::Debug for HttpMarketApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMarketApi").finish_non_exhaustive()
    }
}

impl HttpMarketApi {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        credentials: Arc<Credentials>,
    ) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self { http, credentials })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, UpstreamError> {
        Self::new(
            &cfg.upstream.user_agent,
            Duration::from_secs(cfg.upstream.timeout_secs),
            Arc::new(Credentials::new(cfg.upstream.token.clone())),
        )
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn build_list_request(
        &self,
        source: &SourceConfig,
        params: &[(String, String)],
    ) -> Result<reqwest::Request, UpstreamError> {
        let mut url = join_url(&source.base_url, &source.list_path)?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.authorized_get(url)
    }

    pub fn build_check_request(
        &self,
        source: &SourceConfig,
        item_id: i64,
    ) -> Result<reqwest::Request, UpstreamError> {
        let url = join_url(&source.base_url, &check_path(source, item_id))?;
        self.authorized_get(url)
    }

    fn authorized_get(&self, url: Url) -> Result<reqwest::Request, UpstreamError> {
        let token = self.credentials.token()?;
        self.http
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, "application/json")
            .build()
            .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, UpstreamError> {
        debug!(url = %request.url(), "sending marketplace request");
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(%status, "marketplace rejected credentials; clearing cached token");
            self.credentials.invalidate();
        }
        Ok(response)
    }
}

#[async_trait]
impl MarketApi for HttpMarketApi {
    async fn list_page(
        &self,
        source: &SourceConfig,
        page: u32,
        params: &[(String, String)],
    ) -> Result<ListPage, UpstreamError> {
        let request = self.build_list_request(source, params)?;
        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let page_body: ListPage = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("page {page}: {e}")))?;
        Ok(page_body)
    }

    async fn check_item(
        &self,
        source: &SourceConfig,
        item_id: i64,
    ) -> Result<CheckResponse, UpstreamError> {
        let request = self.build_check_request(source, item_id)?;
        let response = self.execute(request).await?;
        let status = response.status().as_u16();
        let body = if status == 200 {
            response.json::<Value>().await.ok()
        } else {
            None
        };
        Ok(CheckResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FilterValue;
    use crate::schema::presets;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn steam() -> SourceConfig {
        presets()
            .unwrap()
            .into_iter()
            .find(|s| s.slug == "steam")
            .unwrap()
    }

    fn api(token: &str) -> HttpMarketApi {
        HttpMarketApi::new(
            "listing-sync-test",
            Duration::from_secs(5),
            Arc::new(Credentials::new(token)),
        )
        .unwrap()
    }

    #[test]
    fn list_params_order_page_defaults_then_filters() {
        let mut filters = FilterState::new();
        filters.insert("price_min".into(), FilterValue::Number(10.0));
        let params = build_list_params(&steam(), 2, &filters);
        assert_eq!(
            params,
            vec![
                ("page".to_string(), "2".to_string()),
                ("currency".to_string(), "usd".to_string()),
                ("pmin".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn build_list_request_sets_headers_and_query() {
        let source = steam();
        let params = build_list_params(&source, 1, &FilterState::new());
        let request = api("token").build_list_request(&source, &params).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/steam");
        assert_eq!(request.url().query(), Some("page=1&currency=usd"));
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
    }

    #[test]
    fn build_check_request_substitutes_id() {
        let request = api("token").build_check_request(&steam(), 42).unwrap();
        assert_eq!(request.url().path(), "/item/42/check-account");
    }

    #[test]
    fn explicit_token_wins_and_invalidate_clears_cache() {
        let creds = Credentials::new("configured");
        assert_eq!(creds.token().unwrap(), "configured");
        creds.invalidate();
        assert_eq!(creds.token().unwrap(), "configured");
    }

    #[test]
    fn classify_terminal_states_and_statuses() {
        let ok = |state: &str| CheckResponse {
            status: 200,
            body: Some(json!({ "item": { "item_state": state } })),
        };
        assert_eq!(
            classify_check(&ok("paid")),
            ItemStatus::Stale {
                reason: "Item has been sold.".into()
            }
        );
        assert_eq!(
            classify_check(&ok("closed")),
            ItemStatus::Stale {
                reason: "Item state is 'closed'.".into()
            }
        );
        assert!(matches!(classify_check(&ok("active")), ItemStatus::Live { .. }));
        assert_eq!(
            classify_check(&CheckResponse {
                status: 404,
                body: None
            }),
            ItemStatus::Stale {
                reason: "Item not found (404).".into()
            }
        );
        for status in [500, 502, 403] {
            assert!(matches!(
                classify_check(&CheckResponse { status, body: None }),
                ItemStatus::Live { .. }
            ));
        }
        assert!(matches!(
            classify_check(&CheckResponse {
                status: 200,
                body: None
            }),
            ItemStatus::Live { .. }
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_only_on_rate_limit() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, UpstreamError> = retry_rate_limited(&policy, move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(UpstreamError::RateLimited { retry_after: None })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), UpstreamError> = retry_rate_limited(&policy, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            })
        })
        .await;
        assert!(matches!(result, Err(UpstreamError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), UpstreamError> = retry_rate_limited(&policy, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::Transport("reset".into()))
        })
        .await;
        assert!(matches!(result, Err(UpstreamError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
