//! Core document model for Crease.
//!
//! These types are the handoff contract between the scorecard parser and the
//! sync pipeline: a loosely-keyed, human-named match document that the upsert
//! engine resolves onto the normalized schema.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "crease-core";

/// A player as observed in a source document, before canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub name: String,
    pub source_key: Option<String>,
}

impl PlayerRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_key: None,
        }
    }
}

/// A team as observed in a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    pub name: String,
    pub source_key: Option<String>,
}

impl TeamRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueRef {
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub source_key: Option<String>,
}

impl VenueRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            city: None,
            country: None,
            source_key: None,
        }
    }
}

/// One batter's line on a scorecard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattingLine {
    pub player: PlayerRef,
    pub position: Option<i64>,
    pub runs: Option<i64>,
    pub balls: Option<i64>,
    pub minutes: Option<i64>,
    pub fours: Option<i64>,
    pub sixes: Option<i64>,
    pub how_out: Option<String>,
    pub bowler: Option<PlayerRef>,
    pub fielder: Option<PlayerRef>,
}

/// One bowler's line on a scorecard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BowlingLine {
    pub player: PlayerRef,
    pub overs: Option<f64>,
    pub maidens: Option<i64>,
    pub runs: Option<i64>,
    pub wickets: Option<i64>,
    pub wides: Option<i64>,
    pub no_balls: Option<i64>,
    pub econ: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldingLine {
    pub player: PlayerRef,
    pub catches: Option<i64>,
    pub stumpings: Option<i64>,
    pub runouts: Option<i64>,
}

/// A single ball, when the source carries ball-by-ball data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryDoc {
    pub over_no: i64,
    pub ball_no: i64,
    pub striker: PlayerRef,
    pub non_striker: PlayerRef,
    pub bowler: PlayerRef,
    pub runs_off_bat: i64,
    pub extras_bye: i64,
    pub extras_legbye: i64,
    pub extras_wide: i64,
    pub extras_noball: i64,
    pub extras_penalty: i64,
    pub wicket_type: Option<String>,
    pub dismissal_player: Option<PlayerRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InningsDoc {
    pub innings_no: i64,
    pub batting_team: TeamRef,
    pub bowling_team: TeamRef,
    pub runs: Option<i64>,
    pub wickets: Option<i64>,
    pub overs: Option<f64>,
    pub declared: bool,
    pub follow_on_enforced: bool,
    pub batting: Vec<BattingLine>,
    pub bowling: Vec<BowlingLine>,
    pub fielding: Vec<FieldingLine>,
    pub deliveries: Vec<DeliveryDoc>,
}

impl InningsDoc {
    pub fn new(innings_no: i64, batting_team: TeamRef, bowling_team: TeamRef) -> Self {
        Self {
            innings_no,
            batting_team,
            bowling_team,
            runs: None,
            wickets: None,
            overs: None,
            declared: false,
            follow_on_enforced: false,
            batting: Vec::new(),
            bowling: Vec::new(),
            fielding: Vec::new(),
            deliveries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TossDecision {
    Bat,
    Bowl,
}

impl TossDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TossDecision::Bat => "bat",
            TossDecision::Bowl => "bowl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TossInfo {
    pub winner: Option<TeamRef>,
    pub decision: Option<TossDecision>,
}

/// Result summary: win/tie/draw/no_result plus the winner when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResultInfo {
    pub result_type: Option<String>,
    pub winner: Option<TeamRef>,
}

/// The structured match document a parser hands to the upsert engine.
///
/// Every field is optional or defaultable: parsers degrade gracefully and the
/// engine tolerates holes. `source_match_key` is the only idempotency anchor;
/// when present it uniquely identifies the match within a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MatchDoc {
    pub source_match_key: Option<String>,
    pub format: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub venue: Option<VenueRef>,
    pub series_name: Option<String>,
    pub series_key: Option<String>,
    pub teams: Vec<TeamRef>,
    pub day_night: bool,
    pub follow_on: bool,
    pub dl_method: bool,
    pub reserve_day: bool,
    pub toss: TossInfo,
    pub result: ResultInfo,
    pub innings: Vec<InningsDoc>,
    /// Display names observed for this match, kept for later alias review.
    pub aliases: Vec<String>,
}

/// Parser output: a partially populated document plus everything the parser
/// could not extract. Callers are forced to see the degraded case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedScorecard {
    pub doc: MatchDoc,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_doc_defaults_are_empty() {
        let doc = MatchDoc::default();
        assert!(doc.source_match_key.is_none());
        assert!(doc.teams.is_empty());
        assert!(doc.innings.is_empty());
        assert!(!doc.day_night);
    }

    #[test]
    fn toss_decision_round_trips_through_str() {
        assert_eq!(TossDecision::Bat.as_str(), "bat");
        assert_eq!(TossDecision::Bowl.as_str(), "bowl");
    }
}
