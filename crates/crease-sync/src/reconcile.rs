//! Reconciliation against a read-only legacy store.
//!
//! Produces human-review reports only: row-count profiles, duplicate
//! candidates, and similarity-scored name mappings. Nothing here merges or
//! mutates; the output is CSV for an operator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use strsim::normalized_levenshtein;
use tracing::{debug, warn};

pub const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Team,
}

impl EntityKind {
    fn report_name(&self) -> &'static str {
        match self {
            EntityKind::Player => "player_mapping_candidates.csv",
            EntityKind::Team => "team_mapping_candidates.csv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub full_name: String,
    pub born_date: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct MappingCandidate {
    pub legacy_name: String,
    pub legacy_born: Option<String>,
    pub canonical_name: String,
    pub score: f64,
}

pub struct ReconciliationEngine {
    legacy: SqlitePool,
    canonical: SqlitePool,
    threshold: f64,
}

impl ReconciliationEngine {
    pub fn new(legacy: SqlitePool, canonical: SqlitePool, threshold: f64) -> Self {
        Self {
            legacy,
            canonical,
            threshold,
        }
    }

    /// Row count per legacy table (and view). A relation that fails to count
    /// is reported with a `-1` sentinel rather than aborting the profile.
    pub async fn profile_counts(&self) -> Result<BTreeMap<String, i64>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.legacy)
        .await
        .context("listing legacy tables")?;

        let mut counts = BTreeMap::new();
        for name in names {
            let count: i64 = match sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{name}\""))
                .fetch_one(&self.legacy)
                .await
            {
                Ok(count) => count,
                Err(err) => {
                    warn!(table = %name, error = %err, "count failed, reporting sentinel");
                    -1
                }
            };
            counts.insert(name, count);
        }
        Ok(counts)
    }

    /// Legacy players sharing a (full_name, born_date) pair: candidate
    /// duplicates surfaced for review, never auto-resolved.
    pub async fn duplicate_players(&self) -> Result<Vec<DuplicateCandidate>> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT full_name, born_date, COUNT(*) AS c
            FROM players
            GROUP BY full_name, born_date
            HAVING c > 1
            ORDER BY c DESC, full_name
            "#,
        )
        .fetch_all(&self.legacy)
        .await
        .context("querying duplicate players")?;

        Ok(rows
            .into_iter()
            .map(|(full_name, born_date, count)| DuplicateCandidate {
                full_name,
                born_date,
                count,
            })
            .collect())
    }

    /// Best canonical match for every legacy name, kept when the similarity
    /// score clears the threshold. O(legacy × canonical) by design; intended
    /// for tens of thousands of names, not millions.
    pub async fn mapping_candidates(
        &self,
        kind: EntityKind,
        threshold: Option<f64>,
    ) -> Result<Vec<MappingCandidate>> {
        let threshold = threshold.unwrap_or(self.threshold);
        let legacy = self.legacy_names(kind).await?;
        let canonical = self.canonical_names(kind).await?;
        let canonical_norm: Vec<(String, String)> = canonical
            .into_iter()
            .map(|name| (normalize_name(&name), name))
            .collect();

        let mut candidates = Vec::new();
        for (legacy_name, legacy_born) in legacy {
            let legacy_norm = normalize_name(&legacy_name);
            let mut best: Option<(f64, &str)> = None;
            for (canon_norm, canon_name) in &canonical_norm {
                let score = normalized_levenshtein(&legacy_norm, canon_norm);
                if best.map_or(true, |(prev, _)| score > prev) {
                    best = Some((score, canon_name));
                }
            }
            if let Some((score, canon_name)) = best {
                if score >= threshold {
                    candidates.push(MappingCandidate {
                        legacy_name,
                        legacy_born,
                        canonical_name: canon_name.to_string(),
                        score,
                    });
                }
            }
        }
        debug!(kind = ?kind, candidates = candidates.len(), threshold, "mapping candidates computed");
        Ok(candidates)
    }

    async fn legacy_names(&self, kind: EntityKind) -> Result<Vec<(String, Option<String>)>> {
        match kind {
            EntityKind::Player => sqlx::query_as("SELECT full_name, born_date FROM players")
                .fetch_all(&self.legacy)
                .await
                .context("selecting legacy players"),
            EntityKind::Team => {
                let names: Vec<String> = sqlx::query_scalar("SELECT DISTINCT name FROM teams")
                    .fetch_all(&self.legacy)
                    .await
                    .context("selecting legacy teams")?;
                Ok(names.into_iter().map(|n| (n, None)).collect())
            }
        }
    }

    async fn canonical_names(&self, kind: EntityKind) -> Result<Vec<String>> {
        let sql = match kind {
            EntityKind::Player => "SELECT full_name FROM players",
            EntityKind::Team => "SELECT DISTINCT name FROM teams",
        };
        sqlx::query_scalar(sql)
            .fetch_all(&self.canonical)
            .await
            .context("selecting canonical names")
    }

    pub async fn write_counts_report(&self, reports_dir: &Path) -> Result<PathBuf> {
        let counts = self.profile_counts().await?;
        let mut lines = vec!["table,row_count".to_string()];
        for (table, count) in &counts {
            lines.push(format!("{},{}", csv_field(table), count));
        }
        write_report(reports_dir, "legacy_table_counts.csv", &lines)
    }

    pub async fn write_duplicate_players_report(&self, reports_dir: &Path) -> Result<PathBuf> {
        let duplicates = self.duplicate_players().await?;
        let mut lines = vec!["full_name,born_date,count".to_string()];
        for dup in &duplicates {
            lines.push(format!(
                "{},{},{}",
                csv_field(&dup.full_name),
                csv_field(dup.born_date.as_deref().unwrap_or("")),
                dup.count
            ));
        }
        write_report(reports_dir, "duplicate_players.csv", &lines)
    }

    pub async fn write_mapping_report(
        &self,
        kind: EntityKind,
        threshold: Option<f64>,
        reports_dir: &Path,
    ) -> Result<PathBuf> {
        let candidates = self.mapping_candidates(kind, threshold).await?;
        let mut lines = vec!["legacy_name,legacy_born,canonical_name,sim_score".to_string()];
        for candidate in &candidates {
            lines.push(format!(
                "{},{},{},{:.3}",
                csv_field(&candidate.legacy_name),
                csv_field(candidate.legacy_born.as_deref().unwrap_or("")),
                csv_field(&candidate.canonical_name),
                candidate.score
            ));
        }
        write_report(reports_dir, kind.report_name(), &lines)
    }
}

/// Case-fold and collapse whitespace; the form both sides are compared in.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity between two display names on their normalized forms.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_report(reports_dir: &Path, filename: &str, lines: &[String]) -> Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(filename);
    std::fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool")
    }

    async fn seeded_engine() -> ReconciliationEngine {
        let legacy = memory_pool().await;
        sqlx::raw_sql(
            r#"
            CREATE TABLE players (id INTEGER PRIMARY KEY, full_name TEXT, born_date TEXT);
            CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT);
            INSERT INTO players (full_name, born_date) VALUES
                ('Chris Gayle', '1979-09-21'),
                ('Chris Gayle', '1979-09-21'),
                ('Andre Russell', '1988-04-29');
            INSERT INTO teams (name) VALUES ('St. Lucia Zouks'), ('Australia');
            "#,
        )
        .execute(&legacy)
        .await
        .expect("legacy seed");

        let canonical = memory_pool().await;
        sqlx::raw_sql(
            r#"
            CREATE TABLE players (id INTEGER PRIMARY KEY, full_name TEXT);
            CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT);
            INSERT INTO players (full_name) VALUES ('Chris Gayle'), ('Dwayne Bravo');
            INSERT INTO teams (name) VALUES ('St Lucia Zouks'), ('Austria');
            "#,
        )
        .execute(&canonical)
        .await
        .expect("canonical seed");

        ReconciliationEngine::new(legacy, canonical, DEFAULT_THRESHOLD)
    }

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(normalize_name("  St   Lucia  ZOUKS "), "st lucia zouks");
    }

    #[test]
    fn close_variants_clear_the_threshold() {
        let score = name_similarity("St. Lucia Zouks", "St Lucia Zouks");
        assert!(score > 0.9, "expected > 0.9, got {score}");
    }

    #[test]
    fn distinct_names_stay_below_the_threshold() {
        let score = name_similarity("Australia", "Austria");
        assert!(score < 0.9, "expected < 0.9, got {score}");
    }

    #[tokio::test]
    async fn team_mapping_reports_only_confident_candidates() {
        let engine = seeded_engine().await;
        let candidates = engine
            .mapping_candidates(EntityKind::Team, None)
            .await
            .expect("candidates");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].legacy_name, "St. Lucia Zouks");
        assert_eq!(candidates[0].canonical_name, "St Lucia Zouks");
        assert!(candidates[0].score >= 0.9);
    }

    #[tokio::test]
    async fn duplicate_players_groups_by_name_and_birth_date() {
        let engine = seeded_engine().await;
        let duplicates = engine.duplicate_players().await.expect("duplicates");
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].full_name, "Chris Gayle");
        assert_eq!(duplicates[0].count, 2);
    }

    #[tokio::test]
    async fn profile_counts_reports_sentinel_for_broken_relations() {
        let engine = seeded_engine().await;
        sqlx::raw_sql("CREATE VIEW broken AS SELECT missing_col FROM nonexistent_table")
            .execute(&engine.legacy)
            .await
            .expect("broken view");

        let counts = engine.profile_counts().await.expect("counts");
        assert_eq!(counts.get("players"), Some(&3));
        assert_eq!(counts.get("teams"), Some(&2));
        assert_eq!(counts.get("broken"), Some(&-1));
    }

    #[tokio::test]
    async fn reports_land_as_csv_files() {
        let engine = seeded_engine().await;
        let dir = TempDir::new().expect("tempdir");

        let counts_path = engine
            .write_counts_report(dir.path())
            .await
            .expect("counts report");
        let dup_path = engine
            .write_duplicate_players_report(dir.path())
            .await
            .expect("dup report");
        let map_path = engine
            .write_mapping_report(EntityKind::Team, None, dir.path())
            .await
            .expect("mapping report");

        let counts = std::fs::read_to_string(counts_path).expect("read counts");
        assert!(counts.starts_with("table,row_count"));
        let dups = std::fs::read_to_string(dup_path).expect("read dups");
        assert!(dups.contains("Chris Gayle"));
        let mapping = std::fs::read_to_string(map_path).expect("read mapping");
        assert!(mapping.contains("St. Lucia Zouks,,St Lucia Zouks"));
    }

    #[test]
    fn csv_fields_with_commas_are_quoted() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
