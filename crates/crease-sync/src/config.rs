//! Ingestion configuration loaded from the environment.
//!
//! One explicit struct, built once at process start and passed by reference
//! into each component's constructor. `.env` loading happens in the binary
//! entry point before this runs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crease_storage::{BackoffPolicy, FetcherConfig};

use crate::reconcile::DEFAULT_THRESHOLD;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    /// Read-only legacy source for reconciliation, when configured.
    pub legacy_database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    /// Default source when a fetch is not routed through the registry.
    pub source_id: i64,
    pub concurrency: usize,
    pub similarity_threshold: f64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub fetcher: FetcherConfig,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let fetcher = FetcherConfig {
            rps: env_parse("RATE_LIMIT_RPS", 1.0),
            backoff: BackoffPolicy {
                max_retries: env_parse("MAX_RETRIES", 3usize),
                base_delay: Duration::from_millis(env_parse("BACKOFF_BASE_MS", 500u64)),
                max_delay: Duration::from_millis(env_parse("BACKOFF_MAX_MS", 8_000u64)),
            },
            jitter_min: Duration::from_millis(env_parse("JITTER_MIN_MS", 100u64)),
            jitter_max: Duration::from_millis(env_parse("JITTER_MAX_MS", 500u64)),
            max_new_fetches: match env_parse("MAX_NEW_FETCHES", 50u32) {
                0 => None,
                cap => Some(cap),
            },
            allowlist: env_list("URL_ALLOWLIST"),
            blocklist: env_list("URL_BLOCKLIST"),
            user_agents: env_list("USER_AGENTS"),
            default_user_agent: std::env::var("CREASE_USER_AGENT")
                .unwrap_or_else(|_| "crease/0.1".to_string()),
            timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64)),
        };

        Self {
            database_url: std::env::var("CREASE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://crease.db".to_string()),
            legacy_database_url: std::env::var("CREASE_LEGACY_DATABASE_URL").ok(),
            migrations_dir: std::env::var("CREASE_MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("db/migrations")),
            reports_dir: std::env::var("CREASE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            sources_file: std::env::var("CREASE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            source_id: env_parse("CREASE_SOURCE_ID", 1i64),
            concurrency: env_parse("FETCH_CONCURRENCY", 4usize),
            similarity_threshold: env_parse("SIMILARITY_THRESHOLD", DEFAULT_THRESHOLD),
            scheduler_enabled: std::env::var("CREASE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CREASE_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            fetcher,
        }
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        // Scoped to variables this test does not set; from_env falls back.
        let config = IngestConfig::from_env();
        assert!(config.fetcher.rps <= 2.0);
        assert!(config.fetcher.backoff.max_retries >= 1);
        assert!(config.similarity_threshold >= 0.5);
        assert!(config.concurrency >= 1);
    }

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("CREASE_TEST_LIST", " a , b ,, c");
        assert_eq!(env_list("CREASE_TEST_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("CREASE_TEST_LIST");
    }
}
