//! Field -> column mapping
//!
//! Every tracked field is registered exactly once with its value column and,
//! for critical fields, the pair of provenance columns. Registration rejects
//! unknown field names, duplicate fields or columns, malformed identifiers and
//! critical fields without provenance, so nothing downstream ever has to
//! guess a column name or silently skip provenance.

use std::collections::HashSet;

use super::field::MatchField;
use crate::error::{Result, SyncError};

/// Provenance column pair for a critical field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceColumns {
    pub source: String,
    pub timestamp: String,
}

/// Columns backing one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldColumns {
    pub value: String,
    pub provenance: Option<ProvenanceColumns>,
}

/// Validated, complete field registry
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    columns: Vec<FieldColumns>,
}

impl FieldRegistry {
    pub fn builder() -> FieldRegistryBuilder {
        FieldRegistryBuilder::default()
    }

    /// Layout of the `matches` table shipped in `migrations/`
    pub fn standard() -> Result<Self> {
        let mut builder = Self::builder();
        for field in MatchField::ALL {
            let name = field.as_str();
            builder = if field.is_critical() {
                builder.tracked(
                    field,
                    name,
                    &format!("{name}_source"),
                    &format!("{name}_source_ts"),
                )
            } else {
                builder.untracked(field, name)
            };
        }
        builder.build()
    }

    pub fn columns(&self, field: MatchField) -> &FieldColumns {
        &self.columns[field.index()]
    }

    pub fn tracks_provenance(&self, field: MatchField) -> bool {
        self.columns(field).provenance.is_some()
    }
}

#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
    entries: Vec<(MatchField, FieldColumns)>,
    errors: Vec<String>,
}

impl FieldRegistryBuilder {
    /// Register a field that records provenance
    pub fn tracked(mut self, field: MatchField, value: &str, source: &str, timestamp: &str) -> Self {
        self.entries.push((
            field,
            FieldColumns {
                value: value.to_string(),
                provenance: Some(ProvenanceColumns {
                    source: source.to_string(),
                    timestamp: timestamp.to_string(),
                }),
            },
        ));
        self
    }

    /// Register an auxiliary field without provenance
    pub fn untracked(mut self, field: MatchField, value: &str) -> Self {
        self.entries.push((
            field,
            FieldColumns {
                value: value.to_string(),
                provenance: None,
            },
        ));
        self
    }

    /// String-keyed registration, e.g. from configuration
    pub fn named(self, field: &str, value: &str, provenance: Option<(&str, &str)>) -> Self {
        match field.parse::<MatchField>() {
            Ok(f) => match provenance {
                Some((source, ts)) => self.tracked(f, value, source, ts),
                None => self.untracked(f, value),
            },
            Err(_) => {
                let mut this = self;
                this.errors.push(format!("unknown field '{field}'"));
                this
            }
        }
    }

    pub fn build(self) -> Result<FieldRegistry> {
        let mut errors = self.errors;
        let mut slots: Vec<Option<FieldColumns>> = vec![None; MatchField::COUNT];
        let mut seen_columns = HashSet::new();

        for (field, columns) in self.entries {
            if field.is_critical() && columns.provenance.is_none() {
                errors.push(format!("critical field '{field}' registered without provenance"));
            }

            let mut names = vec![columns.value.as_str()];
            if let Some(p) = &columns.provenance {
                names.push(p.source.as_str());
                names.push(p.timestamp.as_str());
            }
            for name in names {
                if !is_identifier(name) {
                    errors.push(format!("invalid column name '{name}' for '{field}'"));
                }
                if !seen_columns.insert(name.to_string()) {
                    errors.push(format!("column '{name}' mapped more than once"));
                }
            }

            let slot = &mut slots[field.index()];
            if slot.is_some() {
                errors.push(format!("field '{field}' registered more than once"));
            } else {
                *slot = Some(columns);
            }
        }

        for field in MatchField::ALL {
            if slots[field.index()].is_none() {
                errors.push(format!("field '{field}' not registered"));
            }
        }

        if !errors.is_empty() {
            return Err(SyncError::FieldRegistry(errors.join("; ")));
        }

        Ok(FieldRegistry {
            columns: slots.into_iter().flatten().collect(),
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_is_complete() {
        let registry = FieldRegistry::standard().unwrap();
        for field in MatchField::ALL {
            assert_eq!(registry.tracks_provenance(field), field.is_critical());
        }
        let status = registry.columns(MatchField::Status);
        assert_eq!(status.value, "status");
        let p = status.provenance.as_ref().unwrap();
        assert_eq!(p.source, "status_source");
        assert_eq!(p.timestamp, "status_source_ts");
    }

    fn all_but_status() -> FieldRegistryBuilder {
        FieldRegistry::builder()
            .tracked(MatchField::Minute, "minute", "minute_src", "minute_ts")
            .tracked(MatchField::HomeScore, "home", "home_src", "home_ts")
            .tracked(MatchField::AwayScore, "away", "away_src", "away_ts")
            .untracked(MatchField::KickoffAt, "kickoff_at")
            .untracked(MatchField::ProviderUpdatedAt, "provider_updated_at")
    }

    #[test]
    fn test_rejects_unknown_field_name() {
        let err = all_but_status()
            .named("status", "status", Some(("status_src", "status_ts")))
            .named("possession", "possession", None)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown field 'possession'"));
    }

    #[test]
    fn test_rejects_critical_field_without_provenance() {
        let err = all_but_status()
            .untracked(MatchField::Status, "status")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("without provenance"));
    }

    #[test]
    fn test_rejects_missing_and_duplicate_registrations() {
        let err = all_but_status().build().unwrap_err();
        assert!(err.to_string().contains("'status' not registered"));

        let err = all_but_status()
            .tracked(MatchField::Status, "status", "status_src", "status_ts")
            .tracked(MatchField::Status, "status2", "status2_src", "status2_ts")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_rejects_bad_or_shared_columns() {
        let err = all_but_status()
            .tracked(MatchField::Status, "status; drop", "status_src", "status_ts")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("invalid column name"));

        let err = all_but_status()
            .tracked(MatchField::Status, "status", "minute_src", "status_ts")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("mapped more than once"));
    }
}
