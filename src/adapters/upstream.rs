//! Upstream match-data provider
//!
//! The reconciliation drain pulls the provider's view of a match through
//! [`MatchSource`] and turns it into stamped field updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::domain::{FieldUpdate, FieldValue, MatchId, MatchStatus, Source, SourcePriorities};
use crate::error::{Result, SyncError};

/// Provider payload for one match. Every field is optional; absent fields
/// produce no update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamMatch {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub minute: Option<i32>,
    #[serde(default)]
    pub home_score: Option<i32>,
    #[serde(default)]
    pub away_score: Option<i32>,
    #[serde(default)]
    pub kickoff_at: Option<DateTime<Utc>>,
    /// Provider-side modification time; used as the update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UpstreamMatch {
    /// Field updates stamped with `source` and its configured priority.
    ///
    /// The provider's `updated_at` is the timestamp when present, otherwise
    /// `observed_at`.
    pub fn to_updates(
        &self,
        match_id: MatchId,
        priorities: &SourcePriorities,
        source: &Source,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<FieldUpdate>> {
        let bad = |reason: String| SyncError::Upstream {
            match_id: match_id.get(),
            reason,
        };
        let non_negative = |name: &str, v: i32| {
            if v < 0 {
                Err(bad(format!("negative {name}: {v}")))
            } else {
                Ok(v)
            }
        };

        let ts = self.updated_at.unwrap_or(observed_at);
        let mut values = Vec::new();

        if let Some(raw) = &self.status {
            values.push(FieldValue::Status(MatchStatus::try_from(raw.as_str()).map_err(bad)?));
        }
        if let Some(m) = self.minute {
            values.push(FieldValue::Minute(Some(non_negative("minute", m)?)));
        }
        if let Some(v) = self.home_score {
            values.push(FieldValue::HomeScore(non_negative("home_score", v)?));
        }
        if let Some(v) = self.away_score {
            values.push(FieldValue::AwayScore(non_negative("away_score", v)?));
        }
        if let Some(t) = self.kickoff_at {
            values.push(FieldValue::KickoffAt(t));
        }
        if let Some(t) = self.updated_at {
            values.push(FieldValue::ProviderUpdatedAt(t));
        }

        Ok(values
            .into_iter()
            .map(|v| priorities.stamp(v, source, ts))
            .collect())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchSource: Send + Sync {
    /// Current provider view of one match
    async fn fetch(&self, id: MatchId) -> Result<UpstreamMatch>;
}

/// JSON-over-HTTP provider: `GET {base_url}/matches/{id}`
#[derive(Clone)]
pub struct HttpMatchSource {
    http: Client,
    base_url: String,
}

impl HttpMatchSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("matchsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build upstream HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MatchSource for HttpMatchSource {
    async fn fetch(&self, id: MatchId) -> Result<UpstreamMatch> {
        let url = format!("{}/matches/{}", self.base_url, id);
        let resp = self.http.get(&url).send().await?;

        match resp.status() {
            s if s.is_success() => {
                let payload = resp.json::<UpstreamMatch>().await?;
                debug!(match_id = %id, "Fetched upstream match");
                Ok(payload)
            }
            StatusCode::NOT_FOUND => Err(SyncError::Upstream {
                match_id: id.get(),
                reason: "not found".to_string(),
            }),
            s => Err(SyncError::Upstream {
                match_id: id.get(),
                reason: format!("HTTP {}", s),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MatchField;
    use chrono::TimeZone;

    fn id() -> MatchId {
        MatchId::new(9).unwrap()
    }

    #[test]
    fn test_payload_deserializes_with_missing_fields() {
        let payload: UpstreamMatch =
            serde_json::from_str(r#"{"status":"HT","home_score":1}"#).unwrap();
        assert_eq!(payload.status.as_deref(), Some("HT"));
        assert_eq!(payload.home_score, Some(1));
        assert!(payload.minute.is_none());
    }

    #[test]
    fn test_to_updates_uses_provider_timestamp_and_priority() {
        let updated = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let payload = UpstreamMatch {
            status: Some("2H".into()),
            minute: Some(61),
            home_score: Some(2),
            away_score: Some(0),
            updated_at: Some(updated),
            ..Default::default()
        };
        let priorities = SourcePriorities::default();
        let updates = payload
            .to_updates(id(), &priorities, &Source::API, Utc::now())
            .unwrap();

        assert_eq!(updates.len(), 5);
        assert!(updates.iter().all(|u| u.timestamp == updated));
        assert!(updates
            .iter()
            .all(|u| u.priority == priorities.priority_of(&Source::API)));
        assert_eq!(updates[0].field(), MatchField::Status);
    }

    #[test]
    fn test_to_updates_rejects_garbage() {
        let priorities = SourcePriorities::default();
        let bad_status = UpstreamMatch {
            status: Some("postponed-ish".into()),
            ..Default::default()
        };
        assert!(bad_status
            .to_updates(id(), &priorities, &Source::API, Utc::now())
            .is_err());

        let negative = UpstreamMatch {
            away_score: Some(-1),
            ..Default::default()
        };
        assert!(negative
            .to_updates(id(), &priorities, &Source::API, Utc::now())
            .is_err());
    }

    #[tokio::test]
    async fn test_mock_source_is_usable_as_trait_object() {
        let mut mock = MockMatchSource::new();
        mock.expect_fetch().returning(|_| {
            Ok(UpstreamMatch {
                status: Some("FT".into()),
                ..Default::default()
            })
        });
        let source: Box<dyn MatchSource> = Box::new(mock);
        let payload = source.fetch(id()).await.unwrap();
        assert_eq!(payload.status.as_deref(), Some("FT"));
    }
}
