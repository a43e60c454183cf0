//! The polite fetcher: one logical fetch = policy check, budget check, rate
//! limit, politeness jitter, transport round trip with retry/backoff, and
//! snapshot persistence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::limit::{classify_reqwest_error, classify_status, BackoffPolicy, RateLimiter, RetryDisposition};
use crate::policy::UrlPolicy;
use crate::snapshot::{SnapshotStore, StoredSnapshot};
use crate::transport::{choose_user_agent, FetchError, HttpTransport, Transport, TransportRequest, TransportResponse};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub rps: f64,
    pub backoff: BackoffPolicy,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Budget of *new* (non-deduplicated) snapshots per run; `None` = unbounded.
    pub max_new_fetches: Option<u32>,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
    pub user_agents: Vec<String>,
    pub default_user_agent: String,
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rps: 1.0,
            backoff: BackoffPolicy::default(),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(500),
            max_new_fetches: Some(50),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            user_agents: Vec::new(),
            default_user_agent: "crease/0.1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Validator from a prior fetch; sent as If-None-Match.
    pub etag: Option<String>,
    /// The page needs script execution; route to the browser transport.
    pub render_js: bool,
    /// HEAD-equivalent probe; nothing is persisted.
    pub headers_only: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            etag: None,
            render_js: false,
            headers_only: false,
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// URL failed the allow/block policy. A deliberate skip, not an error.
    Blocked,
    /// The new-snapshot budget is exhausted; the intent was skipped.
    CapReached,
    /// Conditional GET short-circuited; the body was not re-downloaded.
    NotModified { etag: Option<String> },
    Fetched {
        status: u16,
        body: Vec<u8>,
        etag: Option<String>,
        /// `None` for headers-only probes.
        snapshot: Option<StoredSnapshot>,
    },
}

pub struct PoliteFetcher {
    backoff: BackoffPolicy,
    jitter_min: Duration,
    jitter_max: Duration,
    max_new_fetches: Option<u32>,
    user_agents: Vec<String>,
    default_user_agent: String,
    rate_limiter: RateLimiter,
    policy: UrlPolicy,
    http: Arc<dyn Transport>,
    browser: Option<Arc<dyn Transport>>,
    store: SnapshotStore,
    source_id: i64,
    new_fetches: AtomicU32,
}

impl PoliteFetcher {
    pub fn new(config: &FetcherConfig, store: SnapshotStore, source_id: i64) -> anyhow::Result<Self> {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.timeout)?);
        Ok(Self::with_transport(config, store, source_id, http))
    }

    /// Build against an explicit static transport. Tests and embedders with
    /// custom plumbing use this instead of the reqwest default.
    pub fn with_transport(
        config: &FetcherConfig,
        store: SnapshotStore,
        source_id: i64,
        http: Arc<dyn Transport>,
    ) -> Self {
        Self {
            backoff: config.backoff,
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max,
            max_new_fetches: config.max_new_fetches,
            user_agents: config.user_agents.clone(),
            default_user_agent: config.default_user_agent.clone(),
            rate_limiter: RateLimiter::new(config.rps),
            policy: UrlPolicy::new(&config.allowlist, &config.blocklist),
            http,
            browser: None,
            store,
            source_id,
            new_fetches: AtomicU32::new(0),
        }
    }

    /// Install a scripted-browser transport for `render_js` requests.
    pub fn with_browser_transport(mut self, browser: Arc<dyn Transport>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// New (non-deduplicated) snapshots recorded so far this run.
    pub fn new_fetch_count(&self) -> u32 {
        self.new_fetches.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn fetch(&self, req: FetchRequest) -> Result<FetchOutcome, FetchError> {
        if !self.policy.permits(&req.url) {
            info!(url = %req.url, "url rejected by allow/block policy");
            return Ok(FetchOutcome::Blocked);
        }

        if let Some(cap) = self.max_new_fetches {
            if self.new_fetches.load(Ordering::Relaxed) >= cap {
                info!(url = %req.url, cap, "new-fetch cap reached, skipping intent");
                return Ok(FetchOutcome::CapReached);
            }
        }

        let transport = if req.render_js {
            self.browser.as_ref().ok_or(FetchError::BrowserUnavailable)?
        } else {
            &self.http
        };

        let response = self.roundtrip_with_retries(transport.as_ref(), &req).await?;

        if response.status == StatusCode::NOT_MODIFIED {
            debug!(url = %req.url, "not modified, skipping body download");
            return Ok(FetchOutcome::NotModified { etag: response.etag });
        }

        let snapshot = if req.headers_only {
            None
        } else {
            let stored = self
                .store
                .record(
                    self.source_id,
                    &req.url,
                    response.status.as_u16(),
                    &response.body,
                    response.etag.as_deref(),
                )
                .await?;
            if !stored.deduplicated {
                self.new_fetches.fetch_add(1, Ordering::Relaxed);
            }
            Some(stored)
        };

        Ok(FetchOutcome::Fetched {
            status: response.status.as_u16(),
            body: response.body,
            etag: response.etag,
            snapshot,
        })
    }

    async fn roundtrip_with_retries(
        &self,
        transport: &dyn Transport,
        req: &FetchRequest,
    ) -> Result<TransportResponse, FetchError> {
        let transport_req = TransportRequest {
            url: req.url.clone(),
            etag: req.etag.clone(),
            headers_only: req.headers_only,
            user_agent: choose_user_agent(&self.user_agents, &self.default_user_agent),
        };

        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.rate_limiter.wait().await;
            self.politeness_delay().await;

            match transport.roundtrip(&transport_req).await {
                Ok(resp) => {
                    let status = resp.status;
                    if status.is_success() || status == StatusCode::NOT_MODIFIED {
                        return Ok(resp);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.jittered_delay_for_attempt(attempt);
                        warn!(url = %req.url, status = status.as_u16(), ?delay, "transient status, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: req.url.clone(),
                    });
                }
                Err(FetchError::Request(err)) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.jittered_delay_for_attempt(attempt);
                        warn!(url = %req.url, error = %err, ?delay, "transient transport error, backing off");
                        last_error = Some(FetchError::Request(err));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error.expect("retry loop always records an error before exhausting"))
    }

    async fn politeness_delay(&self) {
        if self.jitter_max.is_zero() {
            return;
        }
        let (min_ms, max_ms) = (
            self.jitter_min.as_millis() as u64,
            self.jitter_max.as_millis() as u64,
        );
        let delay_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min_ms..=max_ms.max(min_ms))
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<TransportResponse, FetchError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn ok(status: u16, body: &[u8]) -> Result<TransportResponse, FetchError> {
            Ok(TransportResponse {
                status: StatusCode::from_u16(status).expect("status"),
                body: body.to_vec(),
                etag: None,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn roundtrip(&self, _req: &TransportRequest) -> Result<TransportResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .expect("scripted transport exhausted")
        }
    }

    async fn snapshot_store() -> SnapshotStore {
        // One connection, or every pooled handle would see its own :memory: db.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        sqlx::query(
            r#"
            CREATE TABLE raw_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                url TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                http_status INTEGER NOT NULL,
                body TEXT NOT NULL,
                etag TEXT,
                content_hash TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&pool)
        .await
        .expect("schema");
        SnapshotStore::new(pool)
    }

    fn quick_config() -> FetcherConfig {
        FetcherConfig {
            rps: 1000.0,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..FetcherConfig::default()
        }
    }

    #[tokio::test]
    async fn blocked_url_never_reaches_the_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let config = FetcherConfig {
            blocklist: vec![r"/private/".to_string()],
            ..quick_config()
        };
        let fetcher =
            PoliteFetcher::with_transport(&config, snapshot_store().await, 1, transport.clone());

        let outcome = fetcher
            .fetch(FetchRequest::get("https://example.com/private/1.html"))
            .await
            .expect("outcome");

        assert!(matches!(outcome, FetchOutcome::Blocked));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn transient_status_is_retried_until_success() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(503, b""),
            ScriptedTransport::ok(200, b"<html>ok</html>"),
        ]);
        let fetcher = PoliteFetcher::with_transport(
            &quick_config(),
            snapshot_store().await,
            1,
            transport.clone(),
        );

        let outcome = fetcher
            .fetch(FetchRequest::get("https://example.com/a"))
            .await
            .expect("outcome");

        match outcome {
            FetchOutcome::Fetched { status, snapshot, .. } => {
                assert_eq!(status, 200);
                assert!(!snapshot.expect("snapshot").deduplicated);
            }
            other => panic!("expected Fetched, got {other:?}"),
        }
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(404, b"")]);
        let fetcher = PoliteFetcher::with_transport(
            &quick_config(),
            snapshot_store().await,
            1,
            transport.clone(),
        );

        let err = fetcher
            .fetch(FetchRequest::get("https://example.com/missing"))
            .await
            .expect_err("404 should fail");

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn conditional_get_short_circuits_on_304() {
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse {
            status: StatusCode::NOT_MODIFIED,
            body: Vec::new(),
            etag: Some("\"v1\"".to_string()),
        })]);
        let store = snapshot_store().await;
        let fetcher =
            PoliteFetcher::with_transport(&quick_config(), store.clone(), 1, transport.clone());

        let mut req = FetchRequest::get("https://example.com/a");
        req.etag = Some("\"v1\"".to_string());
        let outcome = fetcher.fetch(req).await.expect("outcome");

        assert!(matches!(outcome, FetchOutcome::NotModified { .. }));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_snapshots")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn new_fetch_cap_skips_further_intents_but_not_dedups() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(200, b"body-one"),
            ScriptedTransport::ok(200, b"body-one"),
        ]);
        let config = FetcherConfig {
            max_new_fetches: Some(1),
            ..quick_config()
        };
        let fetcher = PoliteFetcher::with_transport(
            &config,
            snapshot_store().await,
            1,
            transport.clone(),
        );

        // First fetch consumes the budget.
        let first = fetcher
            .fetch(FetchRequest::get("https://example.com/1"))
            .await
            .expect("first");
        assert!(matches!(first, FetchOutcome::Fetched { .. }));
        assert_eq!(fetcher.new_fetch_count(), 1);

        // Budget is exhausted; the next intent is skipped before any traffic.
        let second = fetcher
            .fetch(FetchRequest::get("https://example.com/2"))
            .await
            .expect("second");
        assert!(matches!(second, FetchOutcome::CapReached));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn deduplicated_bodies_do_not_consume_the_budget() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(200, b"same-body"),
            ScriptedTransport::ok(200, b"same-body"),
        ]);
        let config = FetcherConfig {
            max_new_fetches: Some(2),
            ..quick_config()
        };
        let fetcher = PoliteFetcher::with_transport(
            &config,
            snapshot_store().await,
            1,
            transport.clone(),
        );

        fetcher
            .fetch(FetchRequest::get("https://example.com/1"))
            .await
            .expect("first");
        let second = fetcher
            .fetch(FetchRequest::get("https://example.com/2"))
            .await
            .expect("second");

        match second {
            FetchOutcome::Fetched { snapshot, .. } => {
                assert!(snapshot.expect("snapshot").deduplicated);
            }
            other => panic!("expected Fetched, got {other:?}"),
        }
        assert_eq!(fetcher.new_fetch_count(), 1);
    }

    #[tokio::test]
    async fn headers_only_probe_persists_nothing() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(200, b"")]);
        let store = snapshot_store().await;
        let fetcher =
            PoliteFetcher::with_transport(&quick_config(), store.clone(), 1, transport);

        let mut req = FetchRequest::get("https://example.com/a");
        req.headers_only = true;
        let outcome = fetcher.fetch(req).await.expect("outcome");

        match outcome {
            FetchOutcome::Fetched { snapshot, .. } => assert!(snapshot.is_none()),
            other => panic!("expected Fetched, got {other:?}"),
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_snapshots")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn render_js_requires_a_browser_transport() {
        let http = ScriptedTransport::new(vec![]);
        let fetcher = PoliteFetcher::with_transport(
            &quick_config(),
            snapshot_store().await,
            1,
            http,
        );

        let mut req = FetchRequest::get("https://example.com/js-page");
        req.render_js = true;
        let err = fetcher.fetch(req).await.expect_err("no browser installed");
        assert!(matches!(err, FetchError::BrowserUnavailable));
    }

    #[tokio::test]
    async fn render_js_routes_to_the_browser_transport() {
        let http = ScriptedTransport::new(vec![]);
        let browser = ScriptedTransport::new(vec![ScriptedTransport::ok(200, b"<html>rendered</html>")]);
        let fetcher = PoliteFetcher::with_transport(
            &quick_config(),
            snapshot_store().await,
            1,
            http.clone(),
        )
        .with_browser_transport(browser.clone());

        let mut req = FetchRequest::get("https://example.com/js-page");
        req.render_js = true;
        let outcome = fetcher.fetch(req).await.expect("outcome");

        assert!(matches!(outcome, FetchOutcome::Fetched { .. }));
        assert_eq!(http.calls(), 0);
        assert_eq!(browser.calls(), 1);
    }
}
