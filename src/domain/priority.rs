use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::field::{FieldUpdate, FieldValue, Source};
use crate::config::SourcesConfig;
use crate::error::{Result, SyncError};

/// Source trust table: label -> priority
#[derive(Debug, Clone)]
pub struct SourcePriorities {
    table: HashMap<String, i32>,
    unknown: i32,
}

impl SourcePriorities {
    pub fn new(table: HashMap<String, i32>, unknown: i32) -> Result<Self> {
        let table: HashMap<String, i32> = table
            .into_iter()
            .map(|(label, p)| (label.trim().to_ascii_lowercase(), p))
            .collect();

        let admin = table.get(Source::ADMIN.as_str()).copied().ok_or_else(|| {
            SyncError::Validation("source priority table must define 'admin'".to_string())
        })?;
        if let Some((label, p)) = table
            .iter()
            .find(|(label, p)| label.as_str() != Source::ADMIN.as_str() && **p >= admin)
        {
            return Err(SyncError::Validation(format!(
                "admin priority {admin} must outrank '{label}' ({p})"
            )));
        }
        if let Some((label, p)) = table.iter().find(|(_, p)| **p <= unknown) {
            return Err(SyncError::Validation(format!(
                "'{label}' ({p}) must outrank unrecognized sources ({unknown})"
            )));
        }

        Ok(Self { table, unknown })
    }

    pub fn from_config(config: &SourcesConfig) -> Result<Self> {
        Self::new(config.priorities.clone(), config.unknown_priority)
    }

    /// Priority for a source label; unrecognized labels get the floor value.
    pub fn priority_of(&self, source: &Source) -> i32 {
        self.table
            .get(source.as_str())
            .copied()
            .unwrap_or(self.unknown)
    }

    /// Build a field update carrying the configured priority for `source`
    pub fn stamp(&self, value: FieldValue, source: &Source, timestamp: DateTime<Utc>) -> FieldUpdate {
        FieldUpdate::new(value, source.clone(), self.priority_of(source), timestamp)
    }
}

impl Default for SourcePriorities {
    fn default() -> Self {
        let config = SourcesConfig::default();
        Self {
            table: config.priorities,
            unknown: config.unknown_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ordering() {
        let p = SourcePriorities::default();
        let admin = p.priority_of(&Source::ADMIN);
        let recovery = p.priority_of(&Source::REALTIME_RECOVERY);
        let realtime = p.priority_of(&Source::REALTIME);
        let api = p.priority_of(&Source::API);
        let computed = p.priority_of(&Source::COMPUTED);
        let bulk = p.priority_of(&Source::BULK);
        let unknown = p.priority_of(&Source::new("scraper"));

        assert!(admin > recovery);
        assert!(recovery > realtime);
        assert!(realtime >= api);
        assert!(api > computed);
        assert!(computed >= bulk);
        assert!(bulk > unknown);
    }

    #[test]
    fn test_default_table_passes_validation() {
        assert!(SourcePriorities::from_config(&SourcesConfig::default()).is_ok());
    }

    #[test]
    fn test_admin_must_be_highest() {
        let table = HashMap::from([("admin".to_string(), 3), ("realtime".to_string(), 3)]);
        assert!(SourcePriorities::new(table, 0).is_err());

        let table = HashMap::from([("api".to_string(), 3)]);
        assert!(SourcePriorities::new(table, 0).is_err());
    }

    #[test]
    fn test_labels_are_case_insensitive() {
        let table = HashMap::from([("Admin".to_string(), 10), ("API".to_string(), 2)]);
        let p = SourcePriorities::new(table, 0).unwrap();
        assert_eq!(p.priority_of(&Source::new("api")), 2);
        assert_eq!(p.priority_of(&Source::new("feed")), 0);
    }
}
