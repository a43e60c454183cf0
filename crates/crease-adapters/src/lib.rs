//! Scorecard extraction: raw HTML → structured match document.
//!
//! The selector heuristics in here are deliberately swappable per source site
//! and are not load-bearing for the rest of the system. What is load-bearing
//! is the contract: [`parse_scorecard`] never fails and never panics on
//! malformed input; whatever cannot be extracted is left empty and recorded
//! as a warning on the result.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crease_core::{
    BattingLine, BowlingLine, DeliveryDoc, InningsDoc, MatchDoc, ParsedScorecard, PlayerRef,
    ResultInfo, TeamRef, TossDecision, TossInfo, VenueRef,
};

pub const CRATE_NAME: &str = "crease-adapters";

static RE_SOURCE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4,})").expect("source key pattern"));
static RE_ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("iso date pattern"));
static RE_TOSS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?) won the toss and elected to (bat|bowl)").expect("toss pattern")
});
static RE_RESULT_WIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+?) won by ").expect("result pattern"));
static RE_CAUGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:c|st)\s+(.+?)\s+b\s+").expect("caught pattern"));
static RE_BOWLED_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bb\s+(.+)$").expect("bowled pattern"));

/// Parse a scorecard page into a match document plus warnings.
///
/// `page_url`, when given, supplies the deterministic `source_match_key` (the
/// first run of four or more digits in the URL).
pub fn parse_scorecard(html_text: &str, page_url: Option<&str>) -> ParsedScorecard {
    let mut warnings: Vec<String> = Vec::new();
    let document = Html::parse_document(html_text);
    let mut doc = MatchDoc::default();

    if let Some(url) = page_url {
        doc.source_match_key = RE_SOURCE_KEY
            .captures(url)
            .map(|caps| caps[1].to_string());
        if doc.source_match_key.is_none() {
            warnings.push(format!("no_source_key_in_url: {url}"));
        }
    }

    if let Some(title) = first_text(&document, "title", &mut warnings) {
        doc.aliases.push(title);
    }

    doc.teams = all_texts(&document, "h2.team", &mut warnings)
        .into_iter()
        .take(2)
        .map(TeamRef::named)
        .collect();
    if doc.teams.len() < 2 {
        warnings.push("teams_incomplete".to_string());
    }

    doc.format = first_text(&document, ".format", &mut warnings);
    doc.series_name = first_text(&document, ".series", &mut warnings);

    if let Some(venue_text) = first_text(&document, ".venue", &mut warnings) {
        doc.venue = Some(parse_venue(&venue_text));
    } else {
        warnings.push("venue_missing".to_string());
    }

    if let Some(dates_text) = first_text(&document, ".match-dates", &mut warnings) {
        let mut dates = RE_ISO_DATE
            .find_iter(&dates_text)
            .filter_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok());
        doc.start_date = dates.next();
        doc.end_date = dates.next().or(doc.start_date);
        if doc.start_date.is_none() {
            warnings.push(format!("dates_unparsed: {dates_text}"));
        }
    }

    if let Some(toss_text) = first_text(&document, ".toss", &mut warnings) {
        match parse_toss(&toss_text) {
            Some(toss) => doc.toss = toss,
            None => warnings.push(format!("toss_unparsed: {toss_text}")),
        }
    }

    if let Some(result_text) = first_text(&document, ".result", &mut warnings) {
        doc.result = parse_result(&result_text);
        if doc.result.result_type.is_none() {
            warnings.push(format!("result_unparsed: {result_text}"));
        }
    }

    if let Some(notes) = first_text(&document, ".notes", &mut warnings) {
        let lower = notes.to_lowercase();
        doc.day_night = lower.contains("day/night") || lower.contains("day-night");
        doc.dl_method = lower.contains("d/l");
        doc.follow_on = lower.contains("follow on") || lower.contains("follow-on");
        doc.reserve_day = lower.contains("reserve day");
    }

    doc.innings = parse_all_innings(&document, &doc.teams, &mut warnings);

    debug!(
        source_match_key = ?doc.source_match_key,
        teams = doc.teams.len(),
        innings = doc.innings.len(),
        warnings = warnings.len(),
        "parsed scorecard"
    );

    ParsedScorecard { doc, warnings }
}

fn parse_venue(text: &str) -> VenueRef {
    // "Ground, City, Country" when the page spells it out; bare name otherwise.
    let mut parts = text.split(',').map(|p| clean_text(p));
    let name = parts.next().unwrap_or_default();
    let city = parts.next().filter(|p| !p.is_empty());
    let country = parts.next().filter(|p| !p.is_empty());
    VenueRef {
        name,
        city,
        country,
        source_key: None,
    }
}

fn parse_toss(text: &str) -> Option<TossInfo> {
    let caps = RE_TOSS.captures(text)?;
    let winner = TeamRef::named(clean_text(&caps[1]));
    let decision = match caps[2].to_lowercase().as_str() {
        "bat" => TossDecision::Bat,
        _ => TossDecision::Bowl,
    };
    Some(TossInfo {
        winner: Some(winner),
        decision: Some(decision),
    })
}

fn parse_result(text: &str) -> ResultInfo {
    let lower = text.to_lowercase();
    if let Some(caps) = RE_RESULT_WIN.captures(text) {
        return ResultInfo {
            result_type: Some("win".to_string()),
            winner: Some(TeamRef::named(clean_text(&caps[1]))),
        };
    }
    let result_type = if lower.contains("drawn") || lower.contains("draw") {
        Some("draw".to_string())
    } else if lower.contains("tied") || lower.contains("tie") {
        Some("tie".to_string())
    } else if lower.contains("no result") {
        Some("no_result".to_string())
    } else {
        None
    };
    ResultInfo {
        result_type,
        winner: None,
    }
}

fn parse_all_innings(
    document: &Html,
    match_teams: &[TeamRef],
    warnings: &mut Vec<String>,
) -> Vec<InningsDoc> {
    let Ok(innings_sel) = selector(".innings", warnings) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (index, section) in document.select(&innings_sel).enumerate() {
        let title = first_text_in(section, ".innings-title", warnings).unwrap_or_default();
        // Match-level sequence, not the per-team ordinal in the heading: the
        // (match, innings_no) key must be unique across both sides.
        let innings_no = index as i64 + 1;

        let batting_team = match_teams
            .iter()
            .find(|t| !t.name.is_empty() && title.starts_with(&t.name))
            .cloned()
            .unwrap_or_else(|| {
                warnings.push(format!("innings_batting_team_unresolved: {title}"));
                TeamRef::named(clean_text(title.split(|c: char| c.is_ascii_digit()).next().unwrap_or("")))
            });
        let bowling_team = match_teams
            .iter()
            .find(|t| t.name != batting_team.name)
            .cloned()
            .unwrap_or_else(|| TeamRef::named(""));

        let mut innings = InningsDoc::new(innings_no, batting_team, bowling_team);

        if let Some(total) = first_text_in(section, ".innings-total", warnings) {
            parse_innings_total(&total, &mut innings);
        }

        innings.batting = parse_batting_lines(section, warnings);
        innings.bowling = parse_bowling_lines(section, warnings);
        innings.deliveries = parse_deliveries(section, warnings);

        if innings.batting.is_empty() {
            warnings.push(format!("innings_{innings_no}_no_batting_lines"));
        }

        out.push(innings);
    }
    out
}

/// "245/8 (50.0 overs)" or "245 all out (61.3 overs)".
fn parse_innings_total(text: &str, innings: &mut InningsDoc) {
    let cleaned = clean_text(text);
    let mut head = cleaned.split_whitespace();
    if let Some(score) = head.next() {
        let mut parts = score.split('/');
        innings.runs = parts.next().and_then(int_or_none);
        innings.wickets = parts.next().and_then(int_or_none);
        if innings.wickets.is_none() && cleaned.to_lowercase().contains("all out") {
            innings.wickets = Some(10);
        }
    }
    if let Some(open) = cleaned.find('(') {
        let tail = &cleaned[open + 1..];
        innings.overs = tail.split_whitespace().next().and_then(float_or_none);
    }
    innings.declared = cleaned.to_lowercase().contains("dec");
}

fn parse_batting_lines(section: ElementRef<'_>, warnings: &mut Vec<String>) -> Vec<BattingLine> {
    let Ok(row_sel) = selector("tr.batting-line", warnings) else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    for (index, row) in section.select(&row_sel).enumerate() {
        let Some(name) = first_text_in(row, ".player", warnings) else {
            warnings.push(format!("batting_line_{index}_no_player"));
            continue;
        };
        let how_out = first_text_in(row, ".how-out", warnings);
        let (bowler, fielder) = how_out
            .as_deref()
            .map(parse_dismissal)
            .unwrap_or((None, None));
        lines.push(BattingLine {
            player: PlayerRef::named(name),
            position: Some(index as i64 + 1),
            runs: cell_int(row, ".runs", warnings),
            balls: cell_int(row, ".balls", warnings),
            minutes: cell_int(row, ".minutes", warnings),
            fours: cell_int(row, ".fours", warnings),
            sixes: cell_int(row, ".sixes", warnings),
            how_out,
            bowler,
            fielder,
        });
    }
    lines
}

/// "c Root b Anderson" → fielder Root, bowler Anderson. "b Anderson" → bowler
/// only. "not out" and friends yield neither.
fn parse_dismissal(how_out: &str) -> (Option<PlayerRef>, Option<PlayerRef>) {
    let fielder = RE_CAUGHT
        .captures(how_out)
        .map(|caps| PlayerRef::named(clean_text(&caps[1])));
    let bowler = RE_BOWLED_BY
        .captures(how_out)
        .map(|caps| PlayerRef::named(clean_text(&caps[1])));
    (bowler, fielder)
}

fn parse_bowling_lines(section: ElementRef<'_>, warnings: &mut Vec<String>) -> Vec<BowlingLine> {
    let Ok(row_sel) = selector("tr.bowling-line", warnings) else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    for (index, row) in section.select(&row_sel).enumerate() {
        let Some(name) = first_text_in(row, ".player", warnings) else {
            warnings.push(format!("bowling_line_{index}_no_player"));
            continue;
        };
        let overs = cell_float(row, ".overs", warnings);
        let runs = cell_int(row, ".runs", warnings);
        let econ = match (overs, runs) {
            (Some(o), Some(r)) if o > 0.0 => Some(r as f64 / o),
            _ => None,
        };
        lines.push(BowlingLine {
            player: PlayerRef::named(name),
            overs,
            maidens: cell_int(row, ".maidens", warnings),
            runs,
            wickets: cell_int(row, ".wickets", warnings),
            wides: cell_int(row, ".wides", warnings),
            no_balls: cell_int(row, ".no-balls", warnings),
            econ,
        });
    }
    lines
}

fn parse_deliveries(section: ElementRef<'_>, warnings: &mut Vec<String>) -> Vec<DeliveryDoc> {
    let Ok(row_sel) = selector("tr.delivery", warnings) else {
        return Vec::new();
    };
    let mut deliveries = Vec::new();
    for (index, row) in section.select(&row_sel).enumerate() {
        let over_no = cell_int(row, ".over", warnings);
        let ball_no = cell_int(row, ".ball", warnings);
        let striker = first_text_in(row, ".striker", warnings);
        let non_striker = first_text_in(row, ".non-striker", warnings);
        let bowler = first_text_in(row, ".bowler", warnings);
        let (Some(over_no), Some(ball_no), Some(striker), Some(non_striker), Some(bowler)) =
            (over_no, ball_no, striker, non_striker, bowler)
        else {
            warnings.push(format!("delivery_{index}_incomplete"));
            continue;
        };
        deliveries.push(DeliveryDoc {
            over_no,
            ball_no,
            striker: PlayerRef::named(striker),
            non_striker: PlayerRef::named(non_striker),
            bowler: PlayerRef::named(bowler),
            runs_off_bat: cell_int(row, ".runs", warnings).unwrap_or(0),
            extras_bye: cell_int(row, ".byes", warnings).unwrap_or(0),
            extras_legbye: cell_int(row, ".legbyes", warnings).unwrap_or(0),
            extras_wide: cell_int(row, ".wides", warnings).unwrap_or(0),
            extras_noball: cell_int(row, ".noballs", warnings).unwrap_or(0),
            extras_penalty: cell_int(row, ".penalty", warnings).unwrap_or(0),
            wicket_type: first_text_in(row, ".wicket", warnings).filter(|s| !s.is_empty()),
            dismissal_player: first_text_in(row, ".dismissed", warnings)
                .filter(|s| !s.is_empty())
                .map(PlayerRef::named),
        });
    }
    deliveries
}

// --- selector plumbing ---

fn selector(css: &str, warnings: &mut Vec<String>) -> Result<Selector, ()> {
    Selector::parse(css).map_err(|err| {
        warnings.push(format!("selector_invalid {css}: {err}"));
    })
}

fn first_text(document: &Html, css: &str, warnings: &mut Vec<String>) -> Option<String> {
    let sel = selector(css, warnings).ok()?;
    document
        .select(&sel)
        .next()
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

fn first_text_in(scope: ElementRef<'_>, css: &str, warnings: &mut Vec<String>) -> Option<String> {
    let sel = selector(css, warnings).ok()?;
    scope
        .select(&sel)
        .next()
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

fn all_texts(document: &Html, css: &str, warnings: &mut Vec<String>) -> Vec<String> {
    let Ok(sel) = selector(css, warnings) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn cell_int(scope: ElementRef<'_>, css: &str, warnings: &mut Vec<String>) -> Option<i64> {
    first_text_in(scope, css, warnings).as_deref().and_then(int_or_none)
}

fn cell_float(scope: ElementRef<'_>, css: &str, warnings: &mut Vec<String>) -> Option<f64> {
    first_text_in(scope, css, warnings).as_deref().and_then(float_or_none)
}

/// Collapse whitespace runs and trim.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn int_or_none(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

fn float_or_none(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}
