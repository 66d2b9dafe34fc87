//! Session-bound advisory locks
//!
//! A [`LockHandle`] owns the backend session (for Postgres: one pooled
//! connection) it was acquired on, so release always happens on the same
//! session. Acquisition failure is not an error: `Ok(None)` means another
//! holder, in this process or another one sharing the backend, has the key.
//!
//! Key space is split into two disjoint ranges:
//! - JOB keys in `[1, JOB_KEY_SPACE)`, one constant per job name
//! - MATCH keys in `[MATCH_KEY_BASE, i64::MAX]`, `MATCH_KEY_BASE + match_id`

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::domain::MatchId;
use crate::error::{Result, SyncError};

/// Upper bound (exclusive) of the JOB key range
pub const JOB_KEY_SPACE: i64 = 1 << 24;
/// First key of the MATCH range
pub const MATCH_KEY_BASE: i64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockNamespace {
    /// One global key per job name
    Job,
    /// One key per match id
    Match,
}

impl fmt::Display for LockNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockNamespace::Job => write!(f, "job"),
            LockNamespace::Match => write!(f, "match"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    namespace: LockNamespace,
    key: i64,
}

impl LockKey {
    /// Constant JOB key for a job name (FNV-1a folded into the JOB range).
    ///
    /// Collisions between two registered names are rejected by the job
    /// registry, not here.
    pub fn for_job(name: &str) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        let span = (JOB_KEY_SPACE - 1) as u64;
        Self {
            namespace: LockNamespace::Job,
            key: 1 + (hash % span) as i64,
        }
    }

    /// MATCH key for a validated match id
    pub fn for_match(id: MatchId) -> Result<Self> {
        let key = MATCH_KEY_BASE
            .checked_add(id.get())
            .ok_or_else(|| SyncError::InvalidMatchId(id.to_string()))?;
        Ok(Self {
            namespace: LockNamespace::Match,
            key,
        })
    }

    /// MATCH key straight from a raw provider id; non-numeric or negative
    /// ids fail here instead of mapping to some other match's key.
    pub fn for_raw_match_id(raw: &str) -> Result<Self> {
        Self::for_match(MatchId::parse(raw)?)
    }

    pub fn namespace(&self) -> LockNamespace {
        self.namespace
    }

    /// Integer handed to the lock backend
    pub fn raw(&self) -> i64 {
        self.key
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// A lock backend hands out sessions that hold one key each
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to take `key` without waiting. `Ok(None)` means busy.
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockSession>>>;

    fn name(&self) -> &'static str;
}

/// A held lock bound to the session it was taken on.
///
/// Implementations must make dropping an unreleased session safe: the
/// underlying session is torn down so the key cannot stay held.
#[async_trait]
pub trait LockSession: Send {
    /// Release on the owning session. Returns whether the backend confirmed
    /// the key was held.
    async fn release(self: Box<Self>) -> Result<bool>;
}

/// Held lock; pass back to [`LockManager::release`]
pub struct LockHandle {
    key: LockKey,
    session: Option<Box<dyn LockSession>>,
    acquired_at: Instant,
}

impl LockHandle {
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("held_ms", &self.acquired_at.elapsed().as_millis())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            // The session tears itself down on drop.
            warn!(lock = %self.key, "Lock handle dropped without release");
        }
    }
}

/// Entry point for JOB and MATCH locks
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Try to acquire `key`; `Ok(None)` when busy
    pub async fn try_acquire(&self, key: LockKey) -> Result<Option<LockHandle>> {
        match self.backend.try_acquire(key).await? {
            Some(session) => {
                debug!(lock = %key, "Lock acquired");
                Ok(Some(LockHandle {
                    key,
                    session: Some(session),
                    acquired_at: Instant::now(),
                }))
            }
            None => {
                debug!(lock = %key, "Lock busy");
                Ok(None)
            }
        }
    }

    pub async fn try_acquire_job(&self, job: &str) -> Result<Option<LockHandle>> {
        self.try_acquire(LockKey::for_job(job)).await
    }

    pub async fn try_acquire_match(&self, id: MatchId) -> Result<Option<LockHandle>> {
        self.try_acquire(LockKey::for_match(id)?).await
    }

    /// Release on the session the handle was acquired on
    pub async fn release(&self, mut handle: LockHandle) -> Result<()> {
        let key = handle.key;
        let held_ms = handle.acquired_at.elapsed().as_millis() as u64;
        let Some(session) = handle.session.take() else {
            return Ok(());
        };

        match session.release().await {
            Ok(true) => {
                debug!(lock = %key, held_ms, "Lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(lock = %key, held_ms, "Backend reports lock was not held at release");
                Ok(())
            }
            Err(e) => {
                error!(lock = %key, held_ms, error = %e, "Lock release failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryLockBackend;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryLockBackend::new()))
    }

    #[test]
    fn test_job_keys_are_stable_and_in_range() {
        let a = LockKey::for_job("reconcile.drain");
        let b = LockKey::for_job("reconcile.drain");
        assert_eq!(a, b);
        assert_eq!(a.namespace(), LockNamespace::Job);
        assert!(a.raw() >= 1 && a.raw() < JOB_KEY_SPACE);
        assert_ne!(a, LockKey::for_job("catalog.refresh"));
    }

    #[test]
    fn test_match_keys_are_injective_and_disjoint_from_jobs() {
        let k0 = LockKey::for_match(MatchId::new(0).unwrap()).unwrap();
        let k1 = LockKey::for_match(MatchId::new(1).unwrap()).unwrap();
        assert_eq!(k0.raw(), MATCH_KEY_BASE);
        assert_eq!(k1.raw(), MATCH_KEY_BASE + 1);
        assert!(k0.raw() >= JOB_KEY_SPACE);
    }

    #[test]
    fn test_invalid_match_ids_fail_fast() {
        assert!(LockKey::for_raw_match_id("abc").is_err());
        assert!(LockKey::for_raw_match_id("-12").is_err());
        assert!(LockKey::for_match(MatchId::new(i64::MAX).unwrap()).is_err());
        assert!(LockKey::for_raw_match_id("12").is_ok());
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let locks = manager();
        let id = MatchId::new(42).unwrap();

        let first = locks.try_acquire_match(id).await.unwrap().expect("free");
        assert!(locks.try_acquire_match(id).await.unwrap().is_none());

        // Different match, different key.
        let other = locks
            .try_acquire_match(MatchId::new(43).unwrap())
            .await
            .unwrap()
            .expect("free");

        locks.release(first).await.unwrap();
        let again = locks.try_acquire_match(id).await.unwrap();
        assert!(again.is_some());

        locks.release(again.unwrap()).await.unwrap();
        locks.release(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_leak() {
        let locks = manager();
        {
            let _handle = locks.try_acquire_job("catalog.refresh").await.unwrap();
        }
        assert!(locks
            .try_acquire_job("catalog.refresh")
            .await
            .unwrap()
            .is_some());
    }
}
