//! Transport abstraction: static HTTP by default, scripted-browser as a
//! swappable implementation of the same trait for pages that need script
//! execution.

use anyhow::Context;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("page requires script execution but no browser transport is installed")]
    BrowserUnavailable,
    #[error("snapshot store: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub etag: Option<String>,
    pub headers_only: bool,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

/// One network round trip. Implementations do not retry or rate-limit; the
/// fetcher owns that contract for every transport uniformly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn roundtrip(&self, req: &TransportRequest) -> Result<TransportResponse, FetchError>;
}

/// Static-HTTP transport over a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn roundtrip(&self, req: &TransportRequest) -> Result<TransportResponse, FetchError> {
        let mut builder = if req.headers_only {
            self.client.head(&req.url)
        } else {
            self.client.get(&req.url)
        };
        builder = builder.header(header::USER_AGENT, &req.user_agent);
        if let Some(etag) = &req.etag {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = if status.is_success() && !req.headers_only {
            resp.bytes().await?.to_vec()
        } else {
            Vec::new()
        };

        Ok(TransportResponse { status, body, etag })
    }
}

/// Pick a User-Agent at random from the pool, or fall back to the default.
pub(crate) fn choose_user_agent(pool: &[String], fallback: &str) -> String {
    pool.choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_falls_back() {
        assert_eq!(choose_user_agent(&[], "crease/0.1"), "crease/0.1");
    }

    #[test]
    fn chosen_agent_comes_from_pool() {
        let pool = vec!["ua-a".to_string(), "ua-b".to_string()];
        let picked = choose_user_agent(&pool, "fallback");
        assert!(pool.contains(&picked));
    }
}
