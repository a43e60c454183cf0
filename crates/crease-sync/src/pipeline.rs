//! Batch ingestion orchestration: fetch → parse → upsert.
//!
//! A bounded worker pool feeds every fetch through the one shared rate
//! limiter; one bad document never aborts the batch. Each run produces a
//! summary with per-item success/failure counts.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crease_adapters::parse_scorecard;
use crease_storage::{FetchOutcome, FetchRequest, PoliteFetcher, SnapshotStore};

use crate::config::IngestConfig;
use crate::upsert::upsert_match;

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: u64,
    pub deduplicated: u64,
    pub not_modified: u64,
    pub blocked: u64,
    pub cap_skipped: u64,
    pub parsed: u64,
    pub upserted: u64,
    pub failed: u64,
    pub warnings: u64,
}

impl IngestSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            fetched: 0,
            deduplicated: 0,
            not_modified: 0,
            blocked: 0,
            cap_skipped: 0,
            parsed: 0,
            upserted: 0,
            failed: 0,
            warnings: 0,
        }
    }
}

enum ItemOutcome {
    Blocked,
    CapReached,
    NotModified,
    Upserted { deduplicated: bool, warnings: u64 },
    Failed,
}

#[derive(Clone)]
pub struct IngestPipeline {
    source_id: i64,
    concurrency: usize,
    scheduler_enabled: bool,
    sync_cron: String,
    fetcher: Arc<PoliteFetcher>,
    pool: SqlitePool,
}

impl IngestPipeline {
    pub fn new(config: &IngestConfig, pool: SqlitePool) -> Result<Self> {
        let store = SnapshotStore::new(pool.clone());
        let fetcher = Arc::new(
            PoliteFetcher::new(&config.fetcher, store, config.source_id)
                .context("building polite fetcher")?,
        );
        Ok(Self::with_fetcher(config, pool, fetcher))
    }

    /// Wire an externally built fetcher (custom or mock transports).
    pub fn with_fetcher(config: &IngestConfig, pool: SqlitePool, fetcher: Arc<PoliteFetcher>) -> Self {
        Self {
            source_id: config.source_id,
            concurrency: config.concurrency.max(1),
            scheduler_enabled: config.scheduler_enabled,
            sync_cron: config.sync_cron.clone(),
            fetcher,
            pool,
        }
    }

    /// Fetch, parse, and upsert a batch of scorecard URLs.
    pub async fn ingest_urls(&self, urls: &[String], render_js: bool) -> IngestSummary {
        let mut summary = IngestSummary::start();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for url in urls {
            let url = url.clone();
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let pool = self.pool.clone();
            let source_id = self.source_id;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                process_one(&fetcher, &pool, source_id, &url, render_js).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "ingest worker panicked");
                    ItemOutcome::Failed
                }
            };
            match outcome {
                ItemOutcome::Blocked => summary.blocked += 1,
                ItemOutcome::CapReached => summary.cap_skipped += 1,
                ItemOutcome::NotModified => summary.not_modified += 1,
                ItemOutcome::Upserted {
                    deduplicated,
                    warnings,
                } => {
                    summary.fetched += 1;
                    summary.parsed += 1;
                    summary.upserted += 1;
                    summary.warnings += warnings;
                    if deduplicated {
                        summary.deduplicated += 1;
                    }
                }
                ItemOutcome::Failed => summary.failed += 1,
            }
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            fetched = summary.fetched,
            deduplicated = summary.deduplicated,
            upserted = summary.upserted,
            failed = summary.failed,
            "ingest batch finished"
        );
        summary
    }

    /// Re-parse recent raw snapshots from the store and upsert them.
    pub async fn parse_stored(
        &self,
        limit: i64,
        days_back: Option<i64>,
        dry_run: bool,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::start();
        let rows = self
            .fetcher
            .store()
            .recent(self.source_id, limit, days_back)
            .await?;

        for row in rows {
            let parsed = parse_scorecard(&row.body, Some(&row.url));
            summary.parsed += 1;
            summary.warnings += parsed.warnings.len() as u64;
            if dry_run {
                continue;
            }
            match upsert_match(&self.pool, &parsed.doc, self.source_id).await {
                Ok((match_id, stats)) => {
                    summary.upserted += 1;
                    info!(snapshot_id = row.id, match_id, ?stats, "snapshot re-upserted");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(snapshot_id = row.id, url = %row.url, error = %err, "snapshot upsert failed");
                }
            }
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Build the cron scheduler when enabled; jobs re-parse recent snapshots.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.clone();
        let job = Job::new_async(self.sync_cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.parse_stored(50, Some(7), false).await {
                    Ok(summary) => info!(
                        parsed = summary.parsed,
                        upserted = summary.upserted,
                        failed = summary.failed,
                        "scheduled re-parse finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled re-parse failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.sync_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn process_one(
    fetcher: &PoliteFetcher,
    pool: &SqlitePool,
    source_id: i64,
    url: &str,
    render_js: bool,
) -> ItemOutcome {
    let etag = match fetcher.store().last_etag(url).await {
        Ok(etag) => etag,
        Err(err) => {
            warn!(url, error = %err, "etag lookup failed, fetching unconditionally");
            None
        }
    };

    let request = FetchRequest {
        url: url.to_string(),
        etag,
        render_js,
        headers_only: false,
    };

    let outcome = match fetcher.fetch(request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(url, error = %err, "fetch failed");
            return ItemOutcome::Failed;
        }
    };

    match outcome {
        FetchOutcome::Blocked => ItemOutcome::Blocked,
        FetchOutcome::CapReached => ItemOutcome::CapReached,
        FetchOutcome::NotModified { .. } => ItemOutcome::NotModified,
        FetchOutcome::Fetched { body, snapshot, .. } => {
            let deduplicated = snapshot.as_ref().is_some_and(|s| s.deduplicated);
            let html = String::from_utf8_lossy(&body);
            let parsed = parse_scorecard(&html, Some(url));
            let warnings = parsed.warnings.len() as u64;
            match upsert_match(pool, &parsed.doc, source_id).await {
                Ok((match_id, stats)) => {
                    info!(url, match_id, ?stats, "match upserted");
                    ItemOutcome::Upserted {
                        deduplicated,
                        warnings,
                    }
                }
                Err(err) => {
                    warn!(url, error = %err, "upsert failed");
                    ItemOutcome::Failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crease_storage::FetcherConfig;
    use sqlx::sqlite::SqlitePoolOptions;

    fn test_config(pool_url: &str) -> IngestConfig {
        IngestConfig {
            database_url: pool_url.to_string(),
            legacy_database_url: None,
            migrations_dir: "db/migrations".into(),
            reports_dir: "reports".into(),
            sources_file: "sources.yaml".into(),
            source_id: 1,
            concurrency: 2,
            similarity_threshold: 0.9,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            fetcher: FetcherConfig::default(),
        }
    }

    #[tokio::test]
    async fn parse_stored_dry_run_parses_without_upserting() {
        let pool = SqlitePoolOptions::new()
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

        let store = SnapshotStore::new(pool.clone());
        store
            .record(
                1,
                "https://example.com/Scorecards/777001.html",
                200,
                b"<html><h2 class=\"team\">A</h2><h2 class=\"team\">B</h2></html>",
                None,
            )
            .await
            .expect("seed snapshot");

        let config = test_config("sqlite::memory:");
        let fetcher = Arc::new(crease_storage::PoliteFetcher::new(
            &config.fetcher,
            store,
            config.source_id,
        )
        .expect("fetcher"));
        let pipeline = IngestPipeline::with_fetcher(&config, pool, fetcher);

        let summary = pipeline.parse_stored(10, None, true).await.expect("summary");
        assert_eq!(summary.parsed, 1);
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn summary_serializes_for_reporting() {
        let summary = IngestSummary::start();
        let json = serde_json::to_value(&summary).expect("json");
        assert!(json.get("run_id").is_some());
        assert_eq!(json.get("fetched").and_then(|v| v.as_u64()), Some(0));
    }
}
