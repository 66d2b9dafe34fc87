//! Write gate
//!
//! The only path that mutates a match record. One `apply` call:
//! 1. takes the MATCH lock without waiting (busy -> `RejectedLocked`, no read)
//! 2. reads value and provenance of every touched field in one query
//! 3. refuses the whole batch if it would move a terminal status
//! 4. arbitrates each field on (priority, timestamp) against the stored
//!    provenance, keeping only winners
//! 5. persists all winners and their provenance in one atomic write
//! 6. emits one event naming only the persisted fields, after commit
//! 7. releases the lock on the session it was taken on
//!
//! Arbitration outcomes are values, not errors. Only store and lock backend
//! failures surface as `Err`.

use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::events::{EventSink, MatchUpdated};
use super::metrics::Metrics;
use crate::adapters::{MatchStore, PersistResult};
use crate::coordination::LockManager;
use crate::domain::{
    supersedes, AcceptedChange, FieldRegistry, FieldSnapshot, FieldUpdate, FieldValue, MatchField,
    MatchId, NewMatch, Source, SourcePriorities,
};
use crate::error::{Result, SyncError};

/// Result of one `apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// At least one field persisted
    Applied {
        accepted: Vec<MatchField>,
        dropped: Vec<MatchField>,
    },
    /// Another writer holds this match
    RejectedLocked,
    /// Status is terminal and the batch tried to change it
    RejectedImmutable,
    /// Nothing in the batch outranked the stored values
    RejectedStale,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied { .. } => "applied",
            ApplyOutcome::RejectedLocked => "rejected_locked",
            ApplyOutcome::RejectedImmutable => "rejected_immutable",
            ApplyOutcome::RejectedStale => "rejected_stale",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-field arbitration result for one batch
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Arbitration {
    /// Winning change per field, in order of first acceptance
    pub accepted: Vec<AcceptedChange>,
    /// Touched fields with no winning update
    pub dropped: Vec<MatchField>,
}

/// Decide which updates win against the stored state.
///
/// Every update is ranked by the configured priority of its source label,
/// the same way stored provenance is ranked, so a caller-supplied
/// `FieldUpdate::priority` cannot outrank the table. Updates for the same
/// field within one batch compete with each other as well: each is compared
/// against the current winner (stored or earlier in the batch).
///
/// Fields the registry does not track provenance for carry no rank of their
/// own. They ride along only when a tracked field in the same batch wins, or
/// when the batch touches no tracked field at all. A rider equal to the
/// stored value is a no-op, and the provider timestamp never moves
/// backwards. Re-submitting the stored terminal status is dropped.
pub fn arbitrate(
    snapshot: &FieldSnapshot,
    updates: &[FieldUpdate],
    registry: &FieldRegistry,
    priorities: &SourcePriorities,
) -> Arbitration {
    let mut winners: HashMap<MatchField, (i32, chrono::DateTime<Utc>)> = snapshot
        .provenance
        .iter()
        .map(|(field, p)| (*field, (priorities.priority_of(&p.source), p.timestamp)))
        .collect();
    let mut current: HashMap<MatchField, FieldValue> = snapshot.values.clone();
    let mut slots: HashMap<MatchField, usize> = HashMap::new();
    let mut accepted: Vec<AcceptedChange> = Vec::new();
    let mut touched: Vec<MatchField> = Vec::new();
    let mut batch_has_tracked = false;
    let mut tracked_won = false;

    for update in updates {
        let field = update.field();
        if !touched.contains(&field) {
            touched.push(field);
        }
        let tracked = registry.tracks_provenance(field);
        batch_has_tracked |= tracked;

        if let FieldValue::Status(s) = update.value {
            if snapshot.status.is_terminal() && s == snapshot.status {
                continue;
            }
        }

        if tracked {
            let priority = priorities.priority_of(&update.source);
            if let Some((stored_priority, stored_ts)) = winners.get(&field) {
                if !supersedes(priority, update.timestamp, *stored_priority, *stored_ts) {
                    continue;
                }
            }
            winners.insert(field, (priority, update.timestamp));
            tracked_won = true;
        } else if !rider_changes(current.get(&field), &update.value) {
            continue;
        }
        current.insert(field, update.value.clone());

        let change = AcceptedChange {
            value: update.value.clone(),
            provenance: tracked.then(|| update.provenance()),
        };
        match slots.get(&field) {
            Some(i) => accepted[*i] = change,
            None => {
                slots.insert(field, accepted.len());
                accepted.push(change);
            }
        }
    }

    if batch_has_tracked && !tracked_won {
        accepted.retain(|c| registry.tracks_provenance(c.field()));
        slots.retain(|f, _| registry.tracks_provenance(*f));
    }

    let dropped = touched
        .into_iter()
        .filter(|f| !slots.contains_key(f))
        .collect();
    Arbitration { accepted, dropped }
}

/// Would an untracked value change what is stored?
fn rider_changes(stored: Option<&FieldValue>, incoming: &FieldValue) -> bool {
    match (stored, incoming) {
        (Some(FieldValue::ProviderUpdatedAt(old)), FieldValue::ProviderUpdatedAt(new)) => new > old,
        (Some(old), new) => old != new,
        (None, _) => true,
    }
}

pub struct WriteGate {
    locks: LockManager,
    store: Arc<dyn MatchStore>,
    registry: FieldRegistry,
    priorities: SourcePriorities,
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl WriteGate {
    pub fn new(
        locks: LockManager,
        store: Arc<dyn MatchStore>,
        registry: FieldRegistry,
        priorities: SourcePriorities,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            locks,
            store,
            registry,
            priorities,
            sink,
            metrics,
        }
    }

    pub fn priorities(&self) -> &SourcePriorities {
        &self.priorities
    }

    pub fn store(&self) -> &Arc<dyn MatchStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Create the record on first sight of a match; `false` if it exists
    pub async fn import(&self, new: NewMatch) -> Result<bool> {
        let created = self.store.insert_if_absent(&new).await?;
        if created {
            info!(match_id = %new.match_id, kickoff_at = %new.kickoff_at, "Match imported");
        } else {
            debug!(match_id = %new.match_id, "Match already imported");
        }
        Ok(created)
    }

    /// Administrative correction: values stamped with the admin source and
    /// the current time
    pub async fn correct(&self, match_id: MatchId, values: Vec<FieldValue>) -> Result<ApplyOutcome> {
        let now = Utc::now();
        let updates = values
            .into_iter()
            .map(|v| self.priorities.stamp(v, &Source::ADMIN, now))
            .collect();
        self.apply(match_id, updates, &Source::ADMIN).await
    }

    pub async fn apply(
        &self,
        match_id: MatchId,
        updates: Vec<FieldUpdate>,
        source: &Source,
    ) -> Result<ApplyOutcome> {
        if updates.is_empty() {
            Metrics::inc(&self.metrics.writes_rejected_stale);
            return Ok(ApplyOutcome::RejectedStale);
        }

        let Some(lock) = self.locks.try_acquire_match(match_id).await? else {
            debug!(%match_id, %source, "Match locked by another writer");
            Metrics::inc(&self.metrics.writes_rejected_locked);
            return Ok(ApplyOutcome::RejectedLocked);
        };

        // A panic in here drops the handle, which tears the session down.
        let result = self.apply_locked(match_id, &updates, source).await;

        // Failures are logged by the lock manager; the write outcome stands.
        let _ = self.locks.release(lock).await;
        result
    }

    async fn apply_locked(
        &self,
        match_id: MatchId,
        updates: &[FieldUpdate],
        source: &Source,
    ) -> Result<ApplyOutcome> {
        let mut fields: Vec<MatchField> = Vec::with_capacity(updates.len());
        for update in updates {
            if !fields.contains(&update.field()) {
                fields.push(update.field());
            }
        }

        let snapshot = self
            .store
            .load_fields(match_id, &fields)
            .await?
            .ok_or(SyncError::MatchNotFound(match_id.get()))?;

        if snapshot.status.is_terminal() {
            let moves_status = updates
                .iter()
                .any(|u| matches!(u.value, FieldValue::Status(s) if !s.is_terminal()));
            if moves_status {
                warn!(
                    %match_id,
                    %source,
                    status = %snapshot.status,
                    "Rejected write to terminal match status"
                );
                Metrics::inc(&self.metrics.writes_rejected_immutable);
                return Ok(ApplyOutcome::RejectedImmutable);
            }
        }

        for u in updates
            .iter()
            .filter(|u| u.priority != self.priorities.priority_of(&u.source))
        {
            debug!(
                %match_id,
                source = %u.source,
                given = u.priority,
                "Update priority differs from the source table, ranking by table"
            );
        }

        let Arbitration { accepted, dropped } =
            arbitrate(&snapshot, updates, &self.registry, &self.priorities);
        Metrics::add(&self.metrics.fields_dropped, dropped.len() as u64);

        if accepted.is_empty() {
            debug!(%match_id, %source, dropped = dropped.len(), "All updates outranked");
            Metrics::inc(&self.metrics.writes_rejected_stale);
            return Ok(ApplyOutcome::RejectedStale);
        }

        let committed_at = Utc::now();
        match self.store.persist(match_id, &accepted, committed_at).await {
            Ok(PersistResult::Written) => {}
            Ok(PersistResult::Missing) => return Err(SyncError::MatchNotFound(match_id.get())),
            Ok(PersistResult::TerminalGuard) => {
                warn!(%match_id, %source, "Persist refused by terminal status guard");
                Metrics::inc(&self.metrics.writes_rejected_immutable);
                return Ok(ApplyOutcome::RejectedImmutable);
            }
            Err(e) => {
                error!(%match_id, %source, error = %e, "Persist failed");
                Metrics::inc(&self.metrics.persist_failures);
                return Err(e);
            }
        }

        let accepted_fields: Vec<MatchField> = accepted.iter().map(|c| c.field()).collect();
        Metrics::inc(&self.metrics.writes_applied);
        Metrics::add(&self.metrics.fields_accepted, accepted.len() as u64);
        debug!(
            %match_id,
            %source,
            accepted = accepted_fields.len(),
            dropped = dropped.len(),
            "Write applied"
        );

        self.sink.on_match_updated(&MatchUpdated {
            match_id,
            source: source.clone(),
            fields: accepted_fields.clone(),
            values: accepted.into_iter().map(|c| c.value).collect(),
            committed_at,
        });
        Metrics::inc(&self.metrics.events_emitted);

        Ok(ApplyOutcome::Applied {
            accepted: accepted_fields,
            dropped,
        })
    }
}
