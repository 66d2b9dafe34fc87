use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use super::state::MatchStatus;
use crate::error::{Result, SyncError};

/// Provider-assigned external match id, validated as a non-negative integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MatchId(i64);

impl MatchId {
    pub fn new(raw: i64) -> Result<Self> {
        if raw < 0 {
            return Err(SyncError::InvalidMatchId(raw.to_string()));
        }
        Ok(Self(raw))
    }

    /// Parse an id as it arrives from a provider or the command line.
    ///
    /// Only plain ASCII digits are accepted; signs, whitespace and anything
    /// non-numeric fail fast instead of being coerced.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::InvalidMatchId(raw.to_string()));
        }
        let value = raw
            .parse::<i64>()
            .map_err(|_| SyncError::InvalidMatchId(raw.to_string()))?;
        Self::new(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MatchId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<i64> for MatchId {
    type Error = SyncError;

    fn try_from(raw: i64) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<MatchId> for i64 {
    fn from(id: MatchId) -> Self {
        id.0
    }
}

/// A tracked field on the match record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Status,
    Minute,
    HomeScore,
    AwayScore,
    KickoffAt,
    ProviderUpdatedAt,
}

impl MatchField {
    pub const COUNT: usize = 6;

    pub const ALL: [MatchField; Self::COUNT] = [
        MatchField::Status,
        MatchField::Minute,
        MatchField::HomeScore,
        MatchField::AwayScore,
        MatchField::KickoffAt,
        MatchField::ProviderUpdatedAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::Status => "status",
            MatchField::Minute => "minute",
            MatchField::HomeScore => "home_score",
            MatchField::AwayScore => "away_score",
            MatchField::KickoffAt => "kickoff_at",
            MatchField::ProviderUpdatedAt => "provider_updated_at",
        }
    }

    /// Critical fields carry a `(source, timestamp)` provenance pair.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MatchField::Status | MatchField::Minute | MatchField::HomeScore | MatchField::AwayScore
        )
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            MatchField::Status => 0,
            MatchField::Minute => 1,
            MatchField::HomeScore => 2,
            MatchField::AwayScore => 3,
            MatchField::KickoffAt => 4,
            MatchField::ProviderUpdatedAt => 5,
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchField {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        MatchField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| SyncError::UnknownField(s.to_string()))
    }
}

/// A value for one tracked field; the variant names the field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Status(MatchStatus),
    Minute(Option<i32>),
    HomeScore(i32),
    AwayScore(i32),
    KickoffAt(DateTime<Utc>),
    ProviderUpdatedAt(DateTime<Utc>),
}

impl FieldValue {
    pub fn field(&self) -> MatchField {
        match self {
            FieldValue::Status(_) => MatchField::Status,
            FieldValue::Minute(_) => MatchField::Minute,
            FieldValue::HomeScore(_) => MatchField::HomeScore,
            FieldValue::AwayScore(_) => MatchField::AwayScore,
            FieldValue::KickoffAt(_) => MatchField::KickoffAt,
            FieldValue::ProviderUpdatedAt(_) => MatchField::ProviderUpdatedAt,
        }
    }

    /// Parse a raw textual value for `field` (admin corrections, fixtures)
    pub fn parse(field: MatchField, raw: &str) -> Result<Self> {
        let invalid = |reason: String| SyncError::Validation(format!("{field}: {reason}"));
        let int = |raw: &str| {
            raw.trim()
                .parse::<i32>()
                .map_err(|e| invalid(e.to_string()))
                .and_then(|v| {
                    if v < 0 {
                        Err(invalid(format!("negative value {v}")))
                    } else {
                        Ok(v)
                    }
                })
        };
        let timestamp = |raw: &str| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| invalid(e.to_string()))
        };

        match field {
            MatchField::Status => MatchStatus::try_from(raw)
                .map(FieldValue::Status)
                .map_err(invalid),
            MatchField::Minute => match raw.trim() {
                "" | "null" | "none" => Ok(FieldValue::Minute(None)),
                other => int(other).map(|m| FieldValue::Minute(Some(m))),
            },
            MatchField::HomeScore => int(raw).map(FieldValue::HomeScore),
            MatchField::AwayScore => int(raw).map(FieldValue::AwayScore),
            MatchField::KickoffAt => timestamp(raw).map(FieldValue::KickoffAt),
            MatchField::ProviderUpdatedAt => timestamp(raw).map(FieldValue::ProviderUpdatedAt),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Status(s) => write!(f, "{}", s),
            FieldValue::Minute(Some(m)) => write!(f, "{}'", m),
            FieldValue::Minute(None) => write!(f, "-"),
            FieldValue::HomeScore(v) | FieldValue::AwayScore(v) => write!(f, "{}", v),
            FieldValue::KickoffAt(t) | FieldValue::ProviderUpdatedAt(t) => {
                write!(f, "{}", t.to_rfc3339())
            }
        }
    }
}

/// Label of a writer proposing field updates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct Source(Cow<'static, str>);

impl Source {
    /// Manual administrative correction
    pub const ADMIN: Source = Source(Cow::Borrowed("admin"));
    /// Real-time feed replaying after a gap
    pub const REALTIME_RECOVERY: Source = Source(Cow::Borrowed("realtime_recovery"));
    /// Real-time push feed
    pub const REALTIME: Source = Source(Cow::Borrowed("realtime"));
    /// Periodic pull from the upstream API
    pub const API: Source = Source(Cow::Borrowed("api"));
    /// Internally computed/derived values
    pub const COMPUTED: Source = Source(Cow::Borrowed("computed"));
    /// Bulk catalog refresh
    pub const BULK: Source = Source(Cow::Borrowed("bulk"));

    pub fn new(label: impl Into<String>) -> Self {
        Source(Cow::Owned(label.into().trim().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Source {
    fn from(label: String) -> Self {
        Source::new(label)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(source, timestamp)` of the last accepted writer for a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: Source,
    pub timestamp: DateTime<Utc>,
}

/// A proposed change to one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub value: FieldValue,
    pub source: Source,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
}

impl FieldUpdate {
    pub fn new(value: FieldValue, source: Source, priority: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            source,
            priority,
            timestamp,
        }
    }

    pub fn field(&self) -> MatchField {
        self.value.field()
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            source: self.source.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Priority/recency rule: the incoming write wins on strictly higher
/// priority, or on equal priority with a newer-or-equal timestamp.
pub fn supersedes(
    incoming_priority: i32,
    incoming_ts: DateTime<Utc>,
    stored_priority: i32,
    stored_ts: DateTime<Utc>,
) -> bool {
    incoming_priority > stored_priority
        || (incoming_priority == stored_priority && incoming_ts >= stored_ts)
}
