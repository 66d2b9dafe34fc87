use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::field::{FieldValue, MatchField, MatchId, Provenance};
use super::state::MatchStatus;

/// The one authoritative record per match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub minute: Option<i32>,
    pub home_score: i32,
    pub away_score: i32,
    pub kickoff_at: DateTime<Utc>,
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Last accepted writer per critical field
    pub provenance: HashMap<MatchField, Provenance>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl MatchRecord {
    /// Fresh record for a first import: not started, nil-nil, no provenance
    pub fn imported(new: &NewMatch, now: DateTime<Utc>) -> Self {
        Self {
            match_id: new.match_id,
            status: MatchStatus::NotStarted,
            minute: None,
            home_score: 0,
            away_score: 0,
            kickoff_at: new.kickoff_at,
            provider_updated_at: None,
            provenance: HashMap::new(),
            created_at: now,
            last_modified: now,
        }
    }

    /// Current value of a field
    pub fn value(&self, field: MatchField) -> Option<FieldValue> {
        match field {
            MatchField::Status => Some(FieldValue::Status(self.status)),
            MatchField::Minute => Some(FieldValue::Minute(self.minute)),
            MatchField::HomeScore => Some(FieldValue::HomeScore(self.home_score)),
            MatchField::AwayScore => Some(FieldValue::AwayScore(self.away_score)),
            MatchField::KickoffAt => Some(FieldValue::KickoffAt(self.kickoff_at)),
            MatchField::ProviderUpdatedAt => self.provider_updated_at.map(FieldValue::ProviderUpdatedAt),
        }
    }

    /// Overwrite a field value (store implementations only)
    pub fn set(&mut self, value: &FieldValue) {
        match value {
            FieldValue::Status(s) => self.status = *s,
            FieldValue::Minute(m) => self.minute = *m,
            FieldValue::HomeScore(v) => self.home_score = *v,
            FieldValue::AwayScore(v) => self.away_score = *v,
            FieldValue::KickoffAt(t) => self.kickoff_at = *t,
            FieldValue::ProviderUpdatedAt(t) => self.provider_updated_at = Some(*t),
        }
    }

    /// Read the subset of fields a write batch touches
    pub fn snapshot(&self, fields: &[MatchField]) -> FieldSnapshot {
        let mut values = HashMap::new();
        let mut provenance = HashMap::new();
        for field in fields {
            if let Some(v) = self.value(*field) {
                values.insert(*field, v);
            }
            if let Some(p) = self.provenance.get(field) {
                provenance.insert(*field, p.clone());
            }
        }
        FieldSnapshot {
            match_id: self.match_id,
            status: self.status,
            values,
            provenance,
        }
    }
}

/// Input for a first import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMatch {
    pub match_id: MatchId,
    pub kickoff_at: DateTime<Utc>,
}

/// What the write gate reads before arbitrating: current values and
/// provenance of the touched fields plus the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSnapshot {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub values: HashMap<MatchField, FieldValue>,
    pub provenance: HashMap<MatchField, Provenance>,
}

/// An accepted field value ready to persist, with the provenance to record
/// (absent for fields the registry does not track provenance for)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedChange {
    pub value: FieldValue,
    pub provenance: Option<Provenance>,
}

impl AcceptedChange {
    pub fn field(&self) -> MatchField {
        self.value.field()
    }
}
