use listing_sync::model::{FilterState, FilterValue, SourceConfig};
use listing_sync::schema::presets;
use listing_sync::upstream::{
    self, BackoffPolicy, Credentials, HttpMarketApi, ItemStatus, MarketApi, UpstreamError,
};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Seen {
    url: String,
    authorization: Option<String>,
    accept: Option<String>,
}

struct Reply {
    status: u16,
    body: String,
    retry_after: Option<&'static str>,
}

fn reply(status: u16, body: &str) -> Reply {
    Reply {
        status,
        body: body.to_string(),
        retry_after: None,
    }
}

/// Marketplace stand-in answering with a fixed script, then 500s.
struct MarketStub {
    base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MarketStub {
    fn spawn(script: Vec<Reply>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start marketplace stub");
        let base_url = format!("http://{}", server.server_addr());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let recorded = Arc::clone(&seen);
        let handle = thread::spawn(move || {
            let mut script = VecDeque::from(script);
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let header = |name: &'static str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv(name))
                        .map(|h| h.value.as_str().to_string())
                };
                recorded.lock().unwrap().push(Seen {
                    url: request.url().to_string(),
                    authorization: header("Authorization"),
                    accept: header("Accept"),
                });

                let next = script.pop_front().unwrap_or_else(|| reply(500, "script exhausted"));
                let mut response =
                    tiny_http::Response::from_string(next.body).with_status_code(next.status);
                response.add_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .unwrap(),
                );
                if let Some(secs) = next.retry_after {
                    let header =
                        tiny_http::Header::from_bytes(&b"Retry-After"[..], secs.as_bytes());
                    response.add_header(header.unwrap());
                }
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            seen,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for MarketStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn source_at(base_url: &str) -> SourceConfig {
    let mut source = presets()
        .unwrap()
        .into_iter()
        .find(|s| s.slug == "steam")
        .unwrap();
    source.base_url = base_url.to_string();
    source
}

fn client() -> HttpMarketApi {
    HttpMarketApi::new(
        "listing-sync-test",
        Duration::from_secs(5),
        Arc::new(Credentials::new("secret-token")),
    )
    .unwrap()
}

#[tokio::test]
async fn list_page_sends_auth_and_query() {
    let stub = MarketStub::spawn(vec![reply(
        200,
        r#"{"items":[{"item_id":1,"title":"a"}],"hasNextPage":true,"totalItems":40}"#,
    )]);
    let source = source_at(&stub.base_url);
    let mut filters = FilterState::new();
    filters.insert("price_max".into(), FilterValue::Number(25.0));
    let params = upstream::build_list_params(&source, 3, &filters);

    let page = client().list_page(&source, 3, &params).await.unwrap();

    assert_eq!(page.items.len(), 1);
    assert!(page.has_next_page);
    assert_eq!(page.total_items, Some(40));
    let seen = stub.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "/steam?page=3&currency=usd&pmax=25");
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer secret-token"));
    assert_eq!(seen[0].accept.as_deref(), Some("application/json"));
}

#[tokio::test]
async fn rate_limit_then_success_is_retried() {
    let stub = MarketStub::spawn(vec![
        Reply {
            status: 429,
            body: "slow down".into(),
            retry_after: Some("0"),
        },
        reply(200, r#"{"items":[],"hasNextPage":false}"#),
    ]);
    let source = source_at(&stub.base_url);
    let api = client();
    let params = upstream::build_list_params(&source, 1, &FilterState::new());
    let policy = BackoffPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
    };

    let page = upstream::retry_rate_limited(&policy, || api.list_page(&source, 1, &params))
        .await
        .unwrap();

    assert!(!page.has_next_page);
    assert_eq!(stub.seen().len(), 2);
}

#[tokio::test]
async fn server_errors_surface_with_body() {
    let stub = MarketStub::spawn(vec![reply(503, "maintenance")]);
    let source = source_at(&stub.base_url);
    let params = upstream::build_list_params(&source, 1, &FilterState::new());

    let err = client().list_page(&source, 1, &params).await.unwrap_err();

    assert_eq!(
        err,
        UpstreamError::Status {
            status: 503,
            body: "maintenance".into()
        }
    );
}

#[tokio::test]
async fn check_answers_are_classified() {
    let stub = MarketStub::spawn(vec![
        reply(200, r#"{"item":{"item_state":"paid"}}"#),
        reply(404, "{}"),
        reply(200, r#"{"item":{"item_state":"active"}}"#),
        reply(502, "bad gateway"),
    ]);
    let source = source_at(&stub.base_url);
    let api = client();

    let mut verdicts = Vec::new();
    for id in [11, 12, 13, 14] {
        let response = api.check_item(&source, id).await.unwrap();
        verdicts.push(upstream::classify_check(&response));
    }

    assert_eq!(
        verdicts,
        vec![
            ItemStatus::Stale {
                reason: "Item has been sold.".into()
            },
            ItemStatus::Stale {
                reason: "Item not found (404).".into()
            },
            ItemStatus::Live {
                reason: "Item is active.".into()
            },
            ItemStatus::Live {
                reason: "Unexpected status: 502".into()
            },
        ]
    );
    let paths: Vec<_> = stub.seen().into_iter().map(|s| s.url).collect();
    assert_eq!(
        paths,
        vec![
            "/item/11/check-account",
            "/item/12/check-account",
            "/item/13/check-account",
            "/item/14/check-account",
        ]
    );
}

#[tokio::test]
async fn check_rate_limit_is_an_error() {
    let stub = MarketStub::spawn(vec![Reply {
        status: 429,
        body: String::new(),
        retry_after: Some("7"),
    }]);
    let source = source_at(&stub.base_url);

    let err = client().check_item(&source, 1).await.unwrap_err();

    assert_eq!(
        err,
        UpstreamError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
}
