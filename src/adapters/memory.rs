//! In-process backends
//!
//! Same contracts as the Postgres adapters, kept in memory. Used for tests,
//! local runs and embedding the engine without a database. Lock state can be
//! shared between several `LockManager`s to stand in for separate processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::store::{CandidateQuery, MatchStore, PersistResult};
use crate::coordination::{LockBackend, LockKey, LockSession};
use crate::domain::{
    AcceptedChange, BoundaryRule, FieldSnapshot, MatchField, MatchId, MatchPhase, MatchRecord,
    MatchStatus, NewMatch,
};
use crate::error::{Result, SyncError};

// ==================== Locks ====================

/// Advisory locks held in a shared set
#[derive(Clone, Default)]
pub struct MemoryLockBackend {
    held: Arc<DashSet<i64>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        self.held.contains(&key.raw())
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockSession>>> {
        if !self.held.insert(key.raw()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLockSession {
            key: key.raw(),
            held: Arc::clone(&self.held),
            released: false,
        })))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryLockSession {
    key: i64,
    held: Arc<DashSet<i64>>,
    released: bool,
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn release(mut self: Box<Self>) -> Result<bool> {
        self.released = true;
        Ok(self.held.remove(&self.key).is_some())
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        if !self.released {
            self.held.remove(&self.key);
        }
    }
}

// ==================== Match records ====================

/// Match records behind one `RwLock`; a persist is a single write-locked
/// mutation, so readers never observe a partial batch.
#[derive(Default)]
pub struct MemoryMatchStore {
    records: RwLock<HashMap<MatchId, MatchRecord>>,
    persist_delay: RwLock<Option<Duration>>,
    fail_persists: AtomicBool,
    loads: AtomicU64,
    persists: AtomicU64,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a record in place as-is (fixtures)
    pub async fn put(&self, record: MatchRecord) {
        self.records.write().await.insert(record.match_id, record);
    }

    /// Sleep this long inside every persist, before the write happens
    pub async fn set_persist_delay(&self, delay: Option<Duration>) {
        *self.persist_delay.write().await = delay;
    }

    /// Make every persist fail with a database-style error
    pub fn set_fail_persists(&self, fail: bool) {
        self.fail_persists.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn status_held_since(record: &MatchRecord) -> DateTime<Utc> {
        record
            .provenance
            .get(&MatchField::Status)
            .map(|p| p.timestamp)
            .unwrap_or(record.last_modified)
    }

    async fn select<F>(&self, limit: usize, predicate: F) -> Vec<MatchId>
    where
        F: Fn(&MatchRecord) -> bool,
    {
        let records = self.records.read().await;
        let mut hits: Vec<&MatchRecord> = records.values().filter(|r| predicate(r)).collect();
        hits.sort_by_key(|r| (r.last_modified, r.match_id));
        hits.into_iter().take(limit).map(|r| r.match_id).collect()
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn insert_if_absent(&self, new: &NewMatch) -> Result<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&new.match_id) {
            return Ok(false);
        }
        records.insert(new.match_id, MatchRecord::imported(new, Utc::now()));
        Ok(true)
    }

    async fn get(&self, id: MatchId) -> Result<Option<MatchRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn load_fields(&self, id: MatchId, fields: &[MatchField]) -> Result<Option<FieldSnapshot>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .map(|record| record.snapshot(fields)))
    }

    async fn persist(
        &self,
        id: MatchId,
        changes: &[AcceptedChange],
        modified_at: DateTime<Utc>,
    ) -> Result<PersistResult> {
        let delay = *self.persist_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_persists.load(Ordering::SeqCst) {
            return Err(SyncError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(PersistResult::Missing);
        };

        let changes_terminal_status = changes.iter().any(|c| {
            matches!(c.value, crate::domain::FieldValue::Status(s) if !s.is_terminal())
        });
        if record.status.is_terminal() && changes_terminal_status {
            return Ok(PersistResult::TerminalGuard);
        }

        for change in changes {
            record.set(&change.value);
            if let Some(p) = &change.provenance {
                record.provenance.insert(change.field(), p.clone());
            }
        }
        record.last_modified = modified_at;
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(PersistResult::Written)
    }

    async fn phase_candidates(&self, phase: MatchPhase, query: &CandidateQuery) -> Result<Vec<MatchId>> {
        let statuses = phase.statuses();
        let kickoff_horizon = query.now + query.pre_start_lookahead;
        let finished_after = query.now - query.recently_finished_window;

        Ok(self
            .select(query.limit, |r| {
                statuses.contains(&r.status)
                    && match phase {
                        MatchPhase::PreStart => r.kickoff_at <= kickoff_horizon,
                        MatchPhase::RecentlyFinished => r.last_modified >= finished_after,
                        _ => true,
                    }
            })
            .await)
    }

    async fn boundary_candidates(&self, rule: &BoundaryRule, query: &CandidateQuery) -> Result<Vec<MatchId>> {
        let now = query.now;
        Ok(match rule {
            BoundaryRule::MinuteAtLeast { status, minute } => {
                self.select(query.limit, |r| {
                    r.status == *status && r.minute.is_some_and(|m| m >= *minute)
                })
                .await
            }
            BoundaryRule::KickoffWithin { secs } => {
                let horizon = now + chrono::Duration::seconds(*secs);
                self.select(query.limit, |r| {
                    r.status == MatchStatus::NotStarted && r.kickoff_at <= horizon
                })
                .await
            }
            BoundaryRule::StatusHeldFor { status, secs } => {
                let since = now - chrono::Duration::seconds(*secs);
                self.select(query.limit, |r| {
                    r.status == *status && Self::status_held_since(r) <= since
                })
                .await
            }
        })
    }

    async fn active_ids(&self, after: Option<MatchId>, limit: usize) -> Result<Vec<MatchId>> {
        let records = self.records.read().await;
        let mut ids: Vec<MatchId> = records
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| after.map_or(true, |a| r.match_id > a))
            .map(|r| r.match_id)
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }
}
