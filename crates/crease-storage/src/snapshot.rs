//! Content-hash-deduplicated raw snapshot store.
//!
//! Every fetched response body lands here exactly once: a byte-identical body
//! is never stored twice, even when fetched from a different URL or at a
//! different time: the existing row's id is returned instead.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub id: i64,
    pub content_hash: String,
    pub deduplicated: bool,
}

/// A previously captured response, as replayed for parse-from-store runs.
#[derive(Debug, Clone)]
pub struct RawSnapshotRow {
    pub id: i64,
    pub url: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Persist a response body, deduplicating on content hash. The hash is
    /// computed over the raw bytes; the body is stored lossily as UTF-8 text.
    pub async fn record(
        &self,
        source_id: i64,
        url: &str,
        http_status: u16,
        body: &[u8],
        etag: Option<&str>,
    ) -> Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(body);

        if let Some(id) = self.find_by_hash(&content_hash).await? {
            return Ok(StoredSnapshot {
                id,
                content_hash,
                deduplicated: true,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO raw_snapshots (source_id, url, fetched_at, http_status, body, etag, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source_id)
        .bind(url)
        .bind(Utc::now().timestamp())
        .bind(http_status as i64)
        .bind(String::from_utf8_lossy(body).into_owned())
        .bind(etag)
        .bind(&content_hash)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => Ok(StoredSnapshot {
                id: done.last_insert_rowid(),
                content_hash,
                deduplicated: false,
            }),
            // A concurrent fetch of the same body won the insert; its row is
            // the canonical one.
            Err(err) if is_unique_violation(&err) => {
                let id = self
                    .find_by_hash(&content_hash)
                    .await?
                    .context("snapshot vanished after unique conflict")?;
                Ok(StoredSnapshot {
                    id,
                    content_hash,
                    deduplicated: true,
                })
            }
            Err(err) => Err(err).context("inserting raw snapshot"),
        }
    }

    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM raw_snapshots WHERE content_hash = ? LIMIT 1")
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await
                .context("looking up snapshot by hash")?;
        Ok(id)
    }

    /// Most recent validator recorded for a URL, for conditional GETs.
    pub async fn last_etag(&self, url: &str) -> Result<Option<String>> {
        let etag: Option<Option<String>> = sqlx::query_scalar(
            "SELECT etag FROM raw_snapshots WHERE url = ? ORDER BY fetched_at DESC, id DESC LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .context("looking up last etag")?;
        Ok(etag.flatten())
    }

    /// Recent snapshots for a source, newest first, optionally bounded to the
    /// last `days_back` days.
    pub async fn recent(
        &self,
        source_id: i64,
        limit: i64,
        days_back: Option<i64>,
    ) -> Result<Vec<RawSnapshotRow>> {
        let since = days_back.map(|days| Utc::now().timestamp() - days * 86_400);
        let rows: Vec<(i64, String, String)> = match since {
            Some(since) => {
                sqlx::query_as(
                    r#"
                    SELECT id, url, body FROM raw_snapshots
                    WHERE source_id = ? AND fetched_at >= ?
                    ORDER BY fetched_at DESC, id DESC LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, url, body FROM raw_snapshots
                    WHERE source_id = ?
                    ORDER BY fetched_at DESC, id DESC LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("selecting recent snapshots")?;

        Ok(rows
            .into_iter()
            .map(|(id, url, body)| RawSnapshotRow { id, url, body })
            .collect())
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}
