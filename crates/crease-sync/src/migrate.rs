//! Checksum-verified SQL migration runner.
//!
//! Migration files apply in lexical filename order (date-prefixed names encode
//! the sequence). Each applied file's SHA-256 checksum is tracked; a changed
//! file that was already applied is refused rather than silently reapplied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

pub const MIGRATIONS_TABLE: &str = "schema_migrations";

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migrations directory not found: {0}")]
    MissingDir(PathBuf),
    #[error("migration '{filename}' has changed since it was applied; rerun with force_reapply to accept the new content")]
    Drift { filename: String },
    #[error("reading migration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("executing migration: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Applied,
    Skipped,
    Reapplied,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Applied => "applied",
            MigrationStatus::Skipped => "skipped",
            MigrationStatus::Reapplied => "reapplied",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub filename: String,
    pub statements: usize,
    pub status: MigrationStatus,
}

pub struct MigrationRunner {
    pool: SqlitePool,
    dir: PathBuf,
}

impl MigrationRunner {
    pub fn new(pool: &SqlitePool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool: pool.clone(),
            dir: dir.into(),
        }
    }

    pub async fn migrate(&self, force_reapply: bool) -> Result<Vec<MigrationOutcome>, MigrateError> {
        if !self.dir.is_dir() {
            return Err(MigrateError::MissingDir(self.dir.clone()));
        }

        self.ensure_tracking_table().await?;
        let applied = self.load_applied().await?;

        let mut results = Vec::new();
        for path in list_sql_files(&self.dir)? {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sql_text = std::fs::read_to_string(&path)?;
            let checksum = compute_checksum(&sql_text);

            match applied.get(&filename) {
                Some(prev) if *prev == checksum && !force_reapply => {
                    results.push(MigrationOutcome {
                        filename,
                        statements: 0,
                        status: MigrationStatus::Skipped,
                    });
                    continue;
                }
                Some(prev) if *prev != checksum && !force_reapply => {
                    return Err(MigrateError::Drift { filename });
                }
                _ => {}
            }

            let statements = self.apply_file(&sql_text, &filename, &checksum).await?;
            let status = if applied.contains_key(&filename) {
                MigrationStatus::Reapplied
            } else {
                MigrationStatus::Applied
            };
            info!(filename, statements, status = status.as_str(), "migration executed");
            results.push(MigrationOutcome {
                filename,
                statements,
                status,
            });
        }

        Ok(results)
    }

    /// Execute every batch of one file plus its tracking update inside a
    /// single transaction.
    async fn apply_file(
        &self,
        sql_text: &str,
        filename: &str,
        checksum: &str,
    ) -> Result<usize, MigrateError> {
        let mut tx = self.pool.begin().await?;
        let mut statements = 0usize;
        for batch in split_sql_batches(sql_text) {
            sqlx::raw_sql(&batch).execute(&mut *tx).await?;
            statements += 1;
        }
        sqlx::query(
            r#"
            INSERT INTO schema_migrations (filename, checksum, applied_at) VALUES (?, ?, ?)
            ON CONFLICT(filename) DO UPDATE SET checksum = excluded.checksum, applied_at = excluded.applied_at
            "#,
        )
        .bind(filename)
        .bind(checksum)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(statements)
    }

    async fn ensure_tracking_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                checksum TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_applied(&self) -> Result<HashMap<String, String>, sqlx::Error> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT filename, checksum FROM schema_migrations")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

pub fn compute_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn list_sql_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    Ok(files)
}

/// Split a migration file into executable batches on `;`-terminated lines.
/// A file that declares a custom `DELIMITER` block is one atomic batch.
pub fn split_sql_batches(sql_text: &str) -> Vec<String> {
    let upper = sql_text.to_uppercase();
    if upper.starts_with("DELIMITER ") || upper.contains("\nDELIMITER ") {
        return vec![sql_text.to_string()];
    }

    let mut batches = Vec::new();
    let mut buffer = String::new();
    for line in sql_text.lines() {
        buffer.push_str(line);
        buffer.push('\n');
        if line.trim_end().ends_with(';') {
            let batch = buffer.trim().to_string();
            if !batch.is_empty() {
                batches.push(batch);
            }
            buffer.clear();
        }
    }
    let tail = buffer.trim().to_string();
    if !tail.is_empty() {
        batches.push(tail);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool")
    }

    fn write_migration(dir: &TempDir, name: &str, sql: &str) {
        std::fs::write(dir.path().join(name), sql).expect("write migration");
    }

    #[test]
    fn batches_split_on_statement_terminators() {
        let batches = split_sql_batches(
            "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (\n  id INTEGER\n);\n",
        );
        assert_eq!(batches.len(), 2);
        assert!(batches[1].starts_with("CREATE TABLE b"));
    }

    #[test]
    fn delimiter_block_is_one_batch() {
        let text = "DELIMITER //\nCREATE TRIGGER t BEGIN SELECT 1; END//\nDELIMITER ;\n";
        let batches = split_sql_batches(text);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn trailing_statement_without_terminator_is_kept() {
        let batches = split_sql_batches("CREATE TABLE a (id INTEGER);\nINSERT INTO a VALUES (1)");
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test]
    async fn applies_in_lexical_order_then_skips() {
        let dir = TempDir::new().expect("tempdir");
        write_migration(&dir, "0002_rows.sql", "INSERT INTO t (n) VALUES (1);");
        write_migration(
            &dir,
            "0001_schema.sql",
            "CREATE TABLE IF NOT EXISTS t (n INTEGER);",
        );

        let pool = pool().await;
        let runner = MigrationRunner::new(&pool, dir.path());

        let first = runner.migrate(false).await.expect("first run");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].filename, "0001_schema.sql");
        assert_eq!(first[0].status, MigrationStatus::Applied);
        assert_eq!(first[1].filename, "0002_rows.sql");

        let second = runner.migrate(false).await.expect("second run");
        assert!(second.iter().all(|o| o.status == MigrationStatus::Skipped));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn drift_is_fatal_and_leaves_tracking_untouched() {
        let dir = TempDir::new().expect("tempdir");
        write_migration(
            &dir,
            "0001_schema.sql",
            "CREATE TABLE IF NOT EXISTS t (n INTEGER);",
        );

        let pool = pool().await;
        let runner = MigrationRunner::new(&pool, dir.path());
        runner.migrate(false).await.expect("initial apply");
        let original_checksum: String =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE filename = ?")
                .bind("0001_schema.sql")
                .fetch_one(&pool)
                .await
                .expect("checksum");

        write_migration(
            &dir,
            "0001_schema.sql",
            "CREATE TABLE IF NOT EXISTS t (n INTEGER, extra TEXT);",
        );

        let err = runner.migrate(false).await.expect_err("drift must fail");
        assert!(matches!(err, MigrateError::Drift { ref filename } if filename == "0001_schema.sql"));

        let tracked: String =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE filename = ?")
                .bind("0001_schema.sql")
                .fetch_one(&pool)
                .await
                .expect("checksum");
        assert_eq!(tracked, original_checksum);
    }

    #[tokio::test]
    async fn force_reapply_accepts_changed_content_and_updates_checksum() {
        let dir = TempDir::new().expect("tempdir");
        write_migration(
            &dir,
            "0001_schema.sql",
            "CREATE TABLE IF NOT EXISTS t (n INTEGER);",
        );

        let pool = pool().await;
        let runner = MigrationRunner::new(&pool, dir.path());
        runner.migrate(false).await.expect("initial apply");

        let changed = "CREATE TABLE IF NOT EXISTS t (n INTEGER);\nCREATE TABLE IF NOT EXISTS u (n INTEGER);";
        write_migration(&dir, "0001_schema.sql", changed);

        let outcomes = runner.migrate(true).await.expect("forced run");
        assert_eq!(outcomes[0].status, MigrationStatus::Reapplied);
        assert_eq!(outcomes[0].statements, 2);

        let tracked: String =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE filename = ?")
                .bind("0001_schema.sql")
                .fetch_one(&pool)
                .await
                .expect("checksum");
        assert_eq!(tracked, compute_checksum(changed));
    }

    #[tokio::test]
    async fn missing_directory_is_reported() {
        let pool = pool().await;
        let runner = MigrationRunner::new(&pool, "/nonexistent/migrations");
        let err = runner.migrate(false).await.expect_err("must fail");
        assert!(matches!(err, MigrateError::MissingDir(_)));
    }
}
