//! Idempotent upserts mapping a match document onto the normalized schema.
//!
//! The whole tree for one match (teams → venue → series/season → match →
//! innings → batting/bowling/fielding → deliveries) commits in a single
//! transaction. Entity resolution is get-or-create on deterministic natural
//! keys; a concurrent creator losing the race re-reads instead of failing.
//! Identity for a match is `source_match_key` alone; name+date matching is
//! deliberately not a dedup key, because team names are ambiguous across
//! sources. Every observed display name is recorded as an alias for manual
//! review; fuzzy similarity never merges anything.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crease_core::{InningsDoc, MatchDoc};
use crease_storage::snapshot::is_unique_violation;

/// Rows touched per entity kind, for observability.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpsertStats {
    pub teams: u64,
    pub players: u64,
    pub innings: u64,
    pub batting: u64,
    pub bowling: u64,
    pub fielding: u64,
    pub deliveries: u64,
}

/// Upsert one match document inside one transaction. Either the whole tree
/// commits or none of it is visible.
///
/// The write lock is taken up front (`BEGIN IMMEDIATE`) so concurrent match
/// ingestions queue on the busy handler instead of failing a half-done tree
/// on a snapshot upgrade.
pub async fn upsert_match(
    pool: &SqlitePool,
    doc: &MatchDoc,
    source_id: i64,
) -> Result<(i64, UpsertStats)> {
    let mut conn = pool.acquire().await.context("acquiring connection")?;
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .context("beginning match transaction")?;

    match upsert_match_tree(&mut *conn, doc, source_id).await {
        Ok(result) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .context("committing match transaction")?;
            Ok(result)
        }
        Err(err) => {
            if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                debug!(error = %rollback_err, "rollback after failed upsert");
            }
            Err(err)
        }
    }
}

async fn upsert_match_tree(
    conn: &mut SqliteConnection,
    doc: &MatchDoc,
    source_id: i64,
) -> Result<(i64, UpsertStats)> {
    let mut stats = UpsertStats::default();

    let mut team_ids = Vec::new();
    for team in &doc.teams {
        if team.name.is_empty() {
            continue;
        }
        let team_id = resolve_team(conn, &team.name, None, source_id).await?;
        team_ids.push(team_id);
        stats.teams += 1;
    }

    let venue_id = match &doc.venue {
        Some(venue) if !venue.name.is_empty() => {
            let country_id = match venue.country.as_deref() {
                Some(country) => Some(get_or_create_country(conn, country).await?),
                None => None,
            };
            Some(get_or_create_venue(conn, &venue.name, country_id).await?)
        }
        _ => None,
    };

    let series_id = match doc.series_name.as_deref() {
        Some(series_name) => {
            let season_id = match doc.start_date {
                Some(date) => Some(get_or_create_season(conn, date).await?),
                None => None,
            };
            Some(get_or_create_series(conn, series_name, season_id).await?)
        }
        None => None,
    };

    let winner_team_id = match doc.result.winner.as_ref().filter(|t| !t.name.is_empty()) {
        Some(winner) => Some(resolve_team(conn, &winner.name, None, source_id).await?),
        None => None,
    };
    let toss_winner_team_id = match doc.toss.winner.as_ref().filter(|t| !t.name.is_empty()) {
        Some(winner) => Some(resolve_team(conn, &winner.name, None, source_id).await?),
        None => None,
    };

    let match_id = upsert_match_row(
        conn,
        doc,
        venue_id,
        series_id,
        winner_team_id,
        toss_winner_team_id,
    )
    .await?;

    for team_id in team_ids.iter().take(2) {
        sqlx::query(
            "INSERT OR IGNORE INTO match_teams (match_id, team_id, is_home) VALUES (?, ?, 0)",
        )
        .bind(match_id)
        .bind(team_id)
        .execute(&mut *conn)
        .await
        .context("linking match team")?;
    }

    for innings in &doc.innings {
        upsert_innings(conn, match_id, innings, source_id, &mut stats).await?;
    }

    debug!(match_id, ?stats, "match tree upserted");
    Ok((match_id, stats))
}

/// Key-based match identity: upsert by `source_match_key` when present,
/// otherwise always insert a new row.
async fn upsert_match_row(
    conn: &mut SqliteConnection,
    doc: &MatchDoc,
    venue_id: Option<i64>,
    series_id: Option<i64>,
    winner_team_id: Option<i64>,
    toss_winner_team_id: Option<i64>,
) -> Result<i64> {
    let format = doc.format.as_deref().unwrap_or("Unknown");
    let toss_decision = doc.toss.decision.map(|d| d.as_str());
    let result_type = doc.result.result_type.as_deref();
    let updated_at = Utc::now().timestamp();

    match doc.source_match_key.as_deref() {
        Some(key) => {
            sqlx::query(
                r#"
                INSERT INTO matches (
                    source_match_key, format, start_date, end_date, venue_id, series_id,
                    result_type, winner_team_id, toss_winner_team_id, toss_decision,
                    day_night, follow_on, dl_method, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_match_key) DO UPDATE SET
                    format = excluded.format,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    venue_id = excluded.venue_id,
                    series_id = excluded.series_id,
                    result_type = excluded.result_type,
                    winner_team_id = excluded.winner_team_id,
                    toss_winner_team_id = excluded.toss_winner_team_id,
                    toss_decision = excluded.toss_decision,
                    day_night = excluded.day_night,
                    follow_on = excluded.follow_on,
                    dl_method = excluded.dl_method,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(format)
            .bind(doc.start_date)
            .bind(doc.end_date)
            .bind(venue_id)
            .bind(series_id)
            .bind(result_type)
            .bind(winner_team_id)
            .bind(toss_winner_team_id)
            .bind(toss_decision)
            .bind(doc.day_night)
            .bind(doc.follow_on)
            .bind(doc.dl_method)
            .bind(updated_at)
            .execute(&mut *conn)
            .await
            .context("upserting match row")?;

            let match_id: i64 = sqlx::query_scalar("SELECT id FROM matches WHERE source_match_key = ?")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .context("reading back match id")?;
            Ok(match_id)
        }
        None => {
            let done = sqlx::query(
                r#"
                INSERT INTO matches (
                    source_match_key, format, start_date, end_date, venue_id, series_id,
                    result_type, winner_team_id, toss_winner_team_id, toss_decision,
                    day_night, follow_on, dl_method, updated_at
                ) VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(format)
            .bind(doc.start_date)
            .bind(doc.end_date)
            .bind(venue_id)
            .bind(series_id)
            .bind(result_type)
            .bind(winner_team_id)
            .bind(toss_winner_team_id)
            .bind(toss_decision)
            .bind(doc.day_night)
            .bind(doc.follow_on)
            .bind(doc.dl_method)
            .bind(updated_at)
            .execute(&mut *conn)
            .await
            .context("inserting keyless match row")?;
            Ok(done.last_insert_rowid())
        }
    }
}

async fn upsert_innings(
    conn: &mut SqliteConnection,
    match_id: i64,
    innings: &InningsDoc,
    source_id: i64,
    stats: &mut UpsertStats,
) -> Result<()> {
    stats.innings += 1;
    let batting_team_id = resolve_team(conn, &innings.batting_team.name, None, source_id).await?;
    let bowling_team_id = resolve_team(conn, &innings.bowling_team.name, None, source_id).await?;

    sqlx::query(
        r#"
        INSERT INTO innings (
            match_id, innings_no, batting_team_id, bowling_team_id,
            runs, wickets, overs, declared, follow_on_enforced
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(match_id, innings_no) DO UPDATE SET
            batting_team_id = excluded.batting_team_id,
            bowling_team_id = excluded.bowling_team_id,
            runs = excluded.runs,
            wickets = excluded.wickets,
            overs = excluded.overs,
            declared = excluded.declared,
            follow_on_enforced = excluded.follow_on_enforced
        "#,
    )
    .bind(match_id)
    .bind(innings.innings_no)
    .bind(batting_team_id)
    .bind(bowling_team_id)
    .bind(innings.runs)
    .bind(innings.wickets)
    .bind(innings.overs)
    .bind(innings.declared)
    .bind(innings.follow_on_enforced)
    .execute(&mut *conn)
    .await
    .context("upserting innings row")?;

    let innings_id: i64 =
        sqlx::query_scalar("SELECT id FROM innings WHERE match_id = ? AND innings_no = ?")
            .bind(match_id)
            .bind(innings.innings_no)
            .fetch_one(&mut *conn)
            .await
            .context("reading back innings id")?;

    for line in &innings.batting {
        stats.batting += 1;
        stats.players += 1;
        let player_id = resolve_player(conn, &line.player.name, None, source_id).await?;
        let bowler_id = match &line.bowler {
            Some(bowler) => Some(resolve_player(conn, &bowler.name, None, source_id).await?),
            None => None,
        };
        let fielder_id = match &line.fielder {
            Some(fielder) => Some(resolve_player(conn, &fielder.name, None, source_id).await?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO batting_innings (
                innings_id, player_id, position, runs, balls, minutes, fours, sixes,
                how_out, bowler_id, fielder_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(innings_id, player_id) DO UPDATE SET
                position = excluded.position,
                runs = excluded.runs,
                balls = excluded.balls,
                minutes = excluded.minutes,
                fours = excluded.fours,
                sixes = excluded.sixes,
                how_out = excluded.how_out,
                bowler_id = excluded.bowler_id,
                fielder_id = excluded.fielder_id
            "#,
        )
        .bind(innings_id)
        .bind(player_id)
        .bind(line.position)
        .bind(line.runs)
        .bind(line.balls)
        .bind(line.minutes)
        .bind(line.fours)
        .bind(line.sixes)
        .bind(line.how_out.as_deref())
        .bind(bowler_id)
        .bind(fielder_id)
        .execute(&mut *conn)
        .await
        .context("upserting batting line")?;
    }

    for line in &innings.bowling {
        stats.bowling += 1;
        stats.players += 1;
        let player_id = resolve_player(conn, &line.player.name, None, source_id).await?;
        sqlx::query(
            r#"
            INSERT INTO bowling_innings (
                innings_id, player_id, overs, maidens, runs, wickets, wides, no_balls, econ
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(innings_id, player_id) DO UPDATE SET
                overs = excluded.overs,
                maidens = excluded.maidens,
                runs = excluded.runs,
                wickets = excluded.wickets,
                wides = excluded.wides,
                no_balls = excluded.no_balls,
                econ = excluded.econ
            "#,
        )
        .bind(innings_id)
        .bind(player_id)
        .bind(line.overs)
        .bind(line.maidens)
        .bind(line.runs)
        .bind(line.wickets)
        .bind(line.wides)
        .bind(line.no_balls)
        .bind(line.econ)
        .execute(&mut *conn)
        .await
        .context("upserting bowling line")?;
    }

    for line in &innings.fielding {
        stats.fielding += 1;
        stats.players += 1;
        let player_id = resolve_player(conn, &line.player.name, None, source_id).await?;
        sqlx::query(
            r#"
            INSERT INTO fielding_innings (innings_id, player_id, catches, stumpings, runouts)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(innings_id, player_id) DO UPDATE SET
                catches = excluded.catches,
                stumpings = excluded.stumpings,
                runouts = excluded.runouts
            "#,
        )
        .bind(innings_id)
        .bind(player_id)
        .bind(line.catches)
        .bind(line.stumpings)
        .bind(line.runouts)
        .execute(&mut *conn)
        .await
        .context("upserting fielding line")?;
    }

    for delivery in &innings.deliveries {
        stats.deliveries += 1;
        let striker_id = resolve_player(conn, &delivery.striker.name, None, source_id).await?;
        let non_striker_id =
            resolve_player(conn, &delivery.non_striker.name, None, source_id).await?;
        let bowler_id = resolve_player(conn, &delivery.bowler.name, None, source_id).await?;
        let dismissal_player_id = match &delivery.dismissal_player {
            Some(player) => Some(resolve_player(conn, &player.name, None, source_id).await?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO deliveries (
                match_id, innings_id, over_no, ball_no, striker_id, non_striker_id, bowler_id,
                runs_off_bat, extras_bye, extras_legbye, extras_wide, extras_noball,
                extras_penalty, wicket_type, dismissal_player_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(innings_id, over_no, ball_no) DO UPDATE SET
                striker_id = excluded.striker_id,
                non_striker_id = excluded.non_striker_id,
                bowler_id = excluded.bowler_id,
                runs_off_bat = excluded.runs_off_bat,
                extras_bye = excluded.extras_bye,
                extras_legbye = excluded.extras_legbye,
                extras_wide = excluded.extras_wide,
                extras_noball = excluded.extras_noball,
                extras_penalty = excluded.extras_penalty,
                wicket_type = excluded.wicket_type,
                dismissal_player_id = excluded.dismissal_player_id
            "#,
        )
        .bind(match_id)
        .bind(innings_id)
        .bind(delivery.over_no)
        .bind(delivery.ball_no)
        .bind(striker_id)
        .bind(non_striker_id)
        .bind(bowler_id)
        .bind(delivery.runs_off_bat)
        .bind(delivery.extras_bye)
        .bind(delivery.extras_legbye)
        .bind(delivery.extras_wide)
        .bind(delivery.extras_noball)
        .bind(delivery.extras_penalty)
        .bind(delivery.wicket_type.as_deref())
        .bind(dismissal_player_id)
        .execute(&mut *conn)
        .await
        .context("upserting delivery")?;
    }

    Ok(())
}

// --- entity resolution ---

/// Resolve a team by natural key, creating it when unseen, and record the
/// observed display name as an alias for this source either way.
async fn resolve_team(
    conn: &mut SqliteConnection,
    name: &str,
    country_id: Option<i64>,
    source_id: i64,
) -> Result<i64> {
    let team_id = get_or_create(
        conn,
        "SELECT id FROM teams WHERE name = ? AND country_id IS ?",
        "INSERT INTO teams (name, country_id) VALUES (?, ?)",
        name,
        country_id,
    )
    .await
    .with_context(|| format!("resolving team {name:?}"))?;

    sqlx::query("INSERT OR IGNORE INTO team_alias (team_id, alias, source_id) VALUES (?, ?, ?)")
        .bind(team_id)
        .bind(name)
        .bind(source_id)
        .execute(&mut *conn)
        .await
        .context("recording team alias")?;

    Ok(team_id)
}

async fn resolve_player(
    conn: &mut SqliteConnection,
    name: &str,
    country_id: Option<i64>,
    source_id: i64,
) -> Result<i64> {
    let player_id = get_or_create(
        conn,
        "SELECT id FROM players WHERE full_name = ? AND country_id IS ?",
        "INSERT INTO players (full_name, country_id) VALUES (?, ?)",
        name,
        country_id,
    )
    .await
    .with_context(|| format!("resolving player {name:?}"))?;

    sqlx::query("INSERT OR IGNORE INTO player_alias (player_id, alias, source_id) VALUES (?, ?, ?)")
        .bind(player_id)
        .bind(name)
        .bind(source_id)
        .execute(&mut *conn)
        .await
        .context("recording player alias")?;

    Ok(player_id)
}

async fn get_or_create_country(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM countries WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .context("looking up country")?;
    if let Some(id) = existing {
        return Ok(id);
    }
    match sqlx::query("INSERT INTO countries (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await
    {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(err) if is_unique_violation(&err) => {
            sqlx::query_scalar("SELECT id FROM countries WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *conn)
                .await
                .context("re-reading country after conflict")
        }
        Err(err) => Err(err).context("inserting country"),
    }
}

async fn get_or_create_venue(
    conn: &mut SqliteConnection,
    name: &str,
    country_id: Option<i64>,
) -> Result<i64> {
    get_or_create(
        conn,
        "SELECT id FROM venues WHERE name = ? AND country_id IS ?",
        "INSERT INTO venues (name, country_id) VALUES (?, ?)",
        name,
        country_id,
    )
    .await
    .with_context(|| format!("resolving venue {name:?}"))
}

async fn get_or_create_season(conn: &mut SqliteConnection, date: chrono::NaiveDate) -> Result<i64> {
    use chrono::Datelike;
    let season_name = date.year().to_string();

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM seasons WHERE name = ?")
        .bind(&season_name)
        .fetch_optional(&mut *conn)
        .await
        .context("looking up season")?;
    if let Some(id) = existing {
        return Ok(id);
    }
    match sqlx::query("INSERT INTO seasons (name, start_date) VALUES (?, ?)")
        .bind(&season_name)
        .bind(date)
        .execute(&mut *conn)
        .await
    {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(err) if is_unique_violation(&err) => {
            sqlx::query_scalar("SELECT id FROM seasons WHERE name = ?")
                .bind(&season_name)
                .fetch_one(&mut *conn)
                .await
                .context("re-reading season after conflict")
        }
        Err(err) => Err(err).context("inserting season"),
    }
}

async fn get_or_create_series(
    conn: &mut SqliteConnection,
    name: &str,
    season_id: Option<i64>,
) -> Result<i64> {
    get_or_create(
        conn,
        "SELECT id FROM series WHERE name = ? AND season_id IS ?",
        "INSERT INTO series (name, season_id) VALUES (?, ?)",
        name,
        season_id,
    )
    .await
    .with_context(|| format!("resolving series {name:?}"))
}

/// Shared get-or-create for (text, nullable-id) natural keys. On a lost
/// insert race the unique constraint fires and the lookup is retried; the
/// constraint stays the source of truth for "is this a duplicate".
async fn get_or_create(
    conn: &mut SqliteConnection,
    select_sql: &str,
    insert_sql: &str,
    name: &str,
    qualifier: Option<i64>,
) -> Result<i64, sqlx::Error> {
    let existing: Option<i64> = sqlx::query_scalar(select_sql)
        .bind(name)
        .bind(qualifier)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    match sqlx::query(insert_sql)
        .bind(name)
        .bind(qualifier)
        .execute(&mut *conn)
        .await
    {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(err) if is_unique_violation(&err) => {
            sqlx::query_scalar(select_sql)
                .bind(name)
                .bind(qualifier)
                .fetch_one(&mut *conn)
                .await
        }
        Err(err) => Err(err),
    }
}
