use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crease_storage::{FetchOutcome, FetchRequest, PoliteFetcher, SnapshotStore};
use crease_sync::{
    db, join_url, EntityKind, IngestConfig, IngestPipeline, MigrationRunner, ReconciliationEngine,
    SourceRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "crease")]
#[command(about = "Polite cricket scorecard ingestion into a normalized store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate {
        /// Reapply files whose checksum changed (accepts drift).
        #[arg(long)]
        force_reapply: bool,
    },
    /// Fetch URLs into the raw snapshot store without parsing.
    Fetch {
        urls: Vec<String>,
        /// Route through the scripted-browser transport.
        #[arg(long)]
        render_js: bool,
        /// HEAD-equivalent probe; persist nothing.
        #[arg(long)]
        headers_only: bool,
    },
    /// Fetch, parse, and upsert a batch of scorecard URLs.
    Ingest {
        urls: Vec<String>,
        #[arg(long)]
        render_js: bool,
    },
    /// Re-parse recent raw snapshots and upsert them.
    ParseLoad {
        #[arg(long, default_value_t = 10)]
        limit: i64,
        #[arg(long)]
        days_back: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Produce reconciliation reports against the legacy store.
    Reconcile {
        #[arg(long = "report", value_enum, required = true)]
        reports: Vec<ReportKind>,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Run scheduled re-parse jobs until interrupted.
    Schedule,
    /// Show canonical table counts.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportKind {
    Counts,
    DupPlayers,
    PlayersMap,
    TeamsMap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenvy::dotenv();
    let config = IngestConfig::from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate { force_reapply } => {
            let pool = db::connect(&config.database_url).await?;
            let runner = MigrationRunner::new(&pool, &config.migrations_dir);
            let outcomes = runner.migrate(force_reapply).await?;
            for outcome in &outcomes {
                println!(
                    "{}  {}  ({} statements)",
                    outcome.status.as_str(),
                    outcome.filename,
                    outcome.statements
                );
            }
            println!("ok ({} files)", outcomes.len());
        }
        Commands::Fetch {
            urls,
            render_js,
            headers_only,
        } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            let pool = db::connect(&config.database_url).await?;
            let store = SnapshotStore::new(pool);
            let fetcher = PoliteFetcher::new(&config.fetcher, store, config.source_id)?;
            let base_url = registry_base_url(&config);

            // Informational robots.txt probe; persists nothing.
            if let Some(base) = &base_url {
                let robots_url = join_url(base, "/robots.txt");
                let request = FetchRequest {
                    url: robots_url.clone(),
                    etag: None,
                    render_js: false,
                    headers_only: true,
                };
                match fetcher.fetch(request).await {
                    Ok(FetchOutcome::Fetched { status, .. }) => {
                        info!(url = %robots_url, status, "robots.txt probe")
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(url = %robots_url, error = %err, "robots.txt probe failed")
                    }
                }
            }

            let mut stored = 0usize;
            let mut skipped = 0usize;
            for url in &urls {
                let url = resolve_url(base_url.as_deref(), url);
                let etag = fetcher.store().last_etag(&url).await.unwrap_or(None);
                let request = FetchRequest {
                    url: url.clone(),
                    etag,
                    render_js,
                    headers_only,
                };
                match fetcher.fetch(request).await {
                    Ok(FetchOutcome::Fetched {
                        status, snapshot, ..
                    }) => {
                        stored += 1;
                        match snapshot {
                            Some(snap) => println!(
                                "fetched {url} status={status} snapshot={} dedup={}",
                                snap.id, snap.deduplicated
                            ),
                            None => println!("probed {url} status={status}"),
                        }
                    }
                    Ok(FetchOutcome::NotModified { .. }) => {
                        skipped += 1;
                        println!("not-modified {url}");
                    }
                    Ok(FetchOutcome::Blocked) => {
                        skipped += 1;
                        println!("blocked {url}");
                    }
                    Ok(FetchOutcome::CapReached) => {
                        skipped += 1;
                        println!("cap-reached {url}");
                    }
                    Err(err) => {
                        skipped += 1;
                        println!("failed {url}: {err}");
                    }
                }
            }
            println!("ok ({stored} fetched, {skipped} skipped)");
        }
        Commands::Ingest { urls, render_js } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            let pool = db::connect(&config.database_url).await?;
            let pipeline = IngestPipeline::new(&config, pool)?;
            let base_url = registry_base_url(&config);
            let resolved: Vec<String> = urls
                .iter()
                .map(|u| resolve_url(base_url.as_deref(), u))
                .collect();

            let summary = pipeline.ingest_urls(&resolved, render_js).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ParseLoad {
            limit,
            days_back,
            dry_run,
        } => {
            let pool = db::connect(&config.database_url).await?;
            let pipeline = IngestPipeline::new(&config, pool)?;
            let summary = pipeline.parse_stored(limit, days_back, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Reconcile { reports, threshold } => {
            let legacy_url = config
                .legacy_database_url
                .as_deref()
                .context("CREASE_LEGACY_DATABASE_URL is not set")?;
            let legacy = db::connect_read_only(legacy_url).await?;
            let canonical = db::connect(&config.database_url).await?;
            let engine =
                ReconciliationEngine::new(legacy, canonical, config.similarity_threshold);

            for report in reports {
                let path = match report {
                    ReportKind::Counts => engine.write_counts_report(&config.reports_dir).await?,
                    ReportKind::DupPlayers => {
                        engine
                            .write_duplicate_players_report(&config.reports_dir)
                            .await?
                    }
                    ReportKind::PlayersMap => {
                        engine
                            .write_mapping_report(EntityKind::Player, threshold, &config.reports_dir)
                            .await?
                    }
                    ReportKind::TeamsMap => {
                        engine
                            .write_mapping_report(EntityKind::Team, threshold, &config.reports_dir)
                            .await?
                    }
                };
                println!("wrote {}", path.display());
            }
        }
        Commands::Schedule => {
            let pool = db::connect(&config.database_url).await?;
            let pipeline = IngestPipeline::new(&config, pool)?;
            match pipeline.maybe_build_scheduler().await? {
                Some(mut scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    info!("scheduler running; ctrl-c to stop");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    scheduler.shutdown().await.ok();
                }
                None => {
                    println!("scheduler disabled; set CREASE_SCHEDULER_ENABLED=1");
                }
            }
        }
        Commands::Status => {
            let pool = db::connect(&config.database_url).await?;
            for table in [
                "raw_snapshots",
                "countries",
                "venues",
                "teams",
                "team_alias",
                "players",
                "player_alias",
                "seasons",
                "series",
                "matches",
                "match_teams",
                "innings",
                "batting_innings",
                "bowling_innings",
                "fielding_innings",
                "deliveries",
            ] {
                let count = db::count_rows(&pool, table).await.unwrap_or(-1);
                println!("{table:>18}  {count}");
            }
        }
    }

    Ok(())
}

/// Base URL of the configured default source, when the registry is present.
fn registry_base_url(config: &IngestConfig) -> Option<String> {
    if !config.sources_file.exists() {
        return None;
    }
    match SourceRegistry::load(&config.sources_file) {
        Ok(registry) => registry
            .source(config.source_id)
            .map(|s| s.base_url.clone()),
        Err(err) => {
            tracing::warn!(error = %err, "source registry unreadable, using raw URLs");
            None
        }
    }
}

fn resolve_url(base: Option<&str>, url: &str) -> String {
    match base {
        Some(base) => join_url(base, url),
        None => url.to_string(),
    }
}
