//! Persistence seam for match records

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    AcceptedChange, BoundaryRule, FieldSnapshot, MatchField, MatchId, MatchPhase, MatchRecord,
    NewMatch,
};
use crate::error::Result;

/// Outcome of a persist attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    /// All values, provenance and the last-modified stamp were written
    Written,
    /// No row for this match id
    Missing,
    /// The row holds a terminal status and the batch tried to change it;
    /// nothing was written
    TerminalGuard,
}

/// Bounds shared by the candidate queries
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
    /// Not-started matches qualify this long before kickoff
    pub pre_start_lookahead: Duration,
    /// Finished matches qualify this long after their last change
    pub recently_finished_window: Duration,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Create the record in its initial status; `false` if it already exists
    async fn insert_if_absent(&self, new: &NewMatch) -> Result<bool>;

    async fn get(&self, id: MatchId) -> Result<Option<MatchRecord>>;

    /// One read returning the current status plus value and provenance of
    /// each requested field
    async fn load_fields(&self, id: MatchId, fields: &[MatchField]) -> Result<Option<FieldSnapshot>>;

    /// One atomic write of all changes, their provenance and `modified_at`
    async fn persist(
        &self,
        id: MatchId,
        changes: &[AcceptedChange],
        modified_at: DateTime<Utc>,
    ) -> Result<PersistResult>;

    /// Ids in `phase`, least recently modified first
    async fn phase_candidates(&self, phase: MatchPhase, query: &CandidateQuery) -> Result<Vec<MatchId>>;

    /// Ids matching a boundary rule, least recently modified first
    async fn boundary_candidates(&self, rule: &BoundaryRule, query: &CandidateQuery) -> Result<Vec<MatchId>>;

    /// Non-terminal ids in ascending order, starting after `after`
    async fn active_ids(&self, after: Option<MatchId>, limit: usize) -> Result<Vec<MatchId>>;
}
