//! Canonicalization core for Crease: idempotent upserts of parsed match
//! documents, checksum-tracked schema migrations, reconciliation against a
//! legacy store, and the batch ingestion pipeline tying them to the fetcher.

pub mod config;
pub mod db;
pub mod migrate;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod upsert;

pub use config::IngestConfig;
pub use migrate::{MigrateError, MigrationOutcome, MigrationRunner, MigrationStatus};
pub use pipeline::{IngestPipeline, IngestSummary};
pub use reconcile::{EntityKind, MappingCandidate, ReconciliationEngine};
pub use registry::{join_url, SourceConfig, SourceRegistry};
pub use upsert::{upsert_match, UpsertStats};

pub const CRATE_NAME: &str = "crease-sync";
