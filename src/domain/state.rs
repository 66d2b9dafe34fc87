use serde::{Deserialize, Serialize};
use std::fmt;

/// Match status as tracked on the authoritative record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MatchStatus {
    /// Imported, kickoff not reached
    NotStarted,
    /// Live but the provider did not say which period
    Live,
    /// First period in play
    FirstHalf,
    /// Intermission between periods
    HalfTime,
    /// Second period in play
    SecondHalf,
    /// Final whistle; terminal
    Finished,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::NotStarted => "NS",
            MatchStatus::Live => "LIVE",
            MatchStatus::FirstHalf => "1H",
            MatchStatus::HalfTime => "HT",
            MatchStatus::SecondHalf => "2H",
            MatchStatus::Finished => "FT",
        }
    }

    /// Once reached, no different status may ever be persisted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Finished)
    }

    /// Is the ball (or the clock) in play?
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MatchStatus::Live | MatchStatus::FirstHalf | MatchStatus::SecondHalf
        )
    }

    /// Scheduling bucket for this status.
    ///
    /// Finished matches only land in [`MatchPhase::RecentlyFinished`]; whether a
    /// given match is still "recent" is decided by the store query, not here.
    pub fn phase(&self) -> MatchPhase {
        match self {
            MatchStatus::NotStarted => MatchPhase::PreStart,
            MatchStatus::Live | MatchStatus::FirstHalf => MatchPhase::FirstPeriod,
            MatchStatus::HalfTime => MatchPhase::Intermission,
            MatchStatus::SecondHalf => MatchPhase::SecondPeriod,
            MatchStatus::Finished => MatchPhase::RecentlyFinished,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MatchStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_uppercase().as_str() {
            "NS" | "NOT_STARTED" | "SCHEDULED" | "TBD" => Ok(MatchStatus::NotStarted),
            "LIVE" | "IN_PLAY" => Ok(MatchStatus::Live),
            "1H" | "FIRST_HALF" => Ok(MatchStatus::FirstHalf),
            "HT" | "HALFTIME" | "HALF_TIME" => Ok(MatchStatus::HalfTime),
            "2H" | "SECOND_HALF" => Ok(MatchStatus::SecondHalf),
            "FT" | "FINISHED" | "FULL_TIME" => Ok(MatchStatus::Finished),
            _ => Err(format!("Unknown match status: {}", s)),
        }
    }
}

impl TryFrom<String> for MatchStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        MatchStatus::try_from(s.as_str())
    }
}

impl From<MatchStatus> for String {
    fn from(status: MatchStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Lifecycle bucket used to pick a reconciliation cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    PreStart,
    FirstPeriod,
    Intermission,
    SecondPeriod,
    RecentlyFinished,
}

impl MatchPhase {
    pub const ALL: [MatchPhase; 5] = [
        MatchPhase::PreStart,
        MatchPhase::FirstPeriod,
        MatchPhase::Intermission,
        MatchPhase::SecondPeriod,
        MatchPhase::RecentlyFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPhase::PreStart => "pre_start",
            MatchPhase::FirstPeriod => "first_period",
            MatchPhase::Intermission => "intermission",
            MatchPhase::SecondPeriod => "second_period",
            MatchPhase::RecentlyFinished => "recently_finished",
        }
    }

    /// Statuses whose matches belong to this bucket
    pub fn statuses(&self) -> &'static [MatchStatus] {
        match self {
            MatchPhase::PreStart => &[MatchStatus::NotStarted],
            MatchPhase::FirstPeriod => &[MatchStatus::Live, MatchStatus::FirstHalf],
            MatchPhase::Intermission => &[MatchStatus::HalfTime],
            MatchPhase::SecondPeriod => &[MatchStatus::SecondHalf],
            MatchPhase::RecentlyFinished => &[MatchStatus::Finished],
        }
    }
}

impl fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Condition under which a match is about to cross a phase boundary and
/// deserves a tighter reconciliation cadence than its bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryRule {
    /// In `status` with the clock at or past `minute` (end of a period)
    MinuteAtLeast { status: MatchStatus, minute: i32 },
    /// Not started, kickoff within `secs` from now (or already overdue)
    KickoffWithin { secs: i64 },
    /// `status` has been held for at least `secs` (e.g. intermission ending)
    StatusHeldFor { status: MatchStatus, secs: i64 },
}

impl fmt::Display for BoundaryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryRule::MinuteAtLeast { status, minute } => {
                write!(f, "{} minute >= {}", status, minute)
            }
            BoundaryRule::KickoffWithin { secs } => write!(f, "kickoff within {}s", secs),
            BoundaryRule::StatusHeldFor { status, secs } => {
                write!(f, "{} held >= {}s", status, secs)
            }
        }
    }
}
