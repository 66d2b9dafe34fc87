//! Periodic and one-shot job execution
//!
//! Every run goes through the same sequence:
//! 1. in-process overlap guard (per job name)
//! 2. optional JOB-namespace lock, shared with other processes on the same
//!    lock backend
//! 3. the body, spawned onto the runtime and awaited under a timeout
//!
//! A timeout is reported but the body keeps running; the overlap guard and
//! the JOB lock stay held until it really finishes, so the next tick of the
//! same job is skipped instead of piling up behind it. Errors and panics from
//! the body become [`JobOutcome::Failed`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::lock::{LockHandle, LockKey, LockManager};
use crate::error::{Result, SyncError};
use crate::services::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// A tick arriving while the previous one runs is skipped
    SkipIfRunning,
    /// Runs may overlap within this process (the JOB lock, if any, still
    /// serializes across processes)
    AllowConcurrent,
}

/// Static description of a job, registered once
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub lock: Option<LockKey>,
    pub timeout: Duration,
    pub overlap: OverlapPolicy,
}

impl JobDescriptor {
    /// Locked, non-overlapping job
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        let name = name.into();
        Self {
            lock: Some(LockKey::for_job(&name)),
            name,
            timeout,
            overlap: OverlapPolicy::SkipIfRunning,
        }
    }

    /// Process-local job; no JOB lock is taken
    pub fn local(mut self) -> Self {
        self.lock = None;
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }
}

/// Registered jobs by name. Names and JOB keys must be unique.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, JobDescriptor>,
    keys: HashMap<i64, String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: JobDescriptor) -> Result<()> {
        if job.name.trim().is_empty() {
            return Err(SyncError::JobRegistry("job name must not be empty".to_string()));
        }
        if self.jobs.contains_key(&job.name) {
            return Err(SyncError::JobRegistry(format!(
                "job '{}' registered twice",
                job.name
            )));
        }
        if job.timeout.is_zero() {
            return Err(SyncError::JobRegistry(format!(
                "job '{}' has a zero timeout",
                job.name
            )));
        }
        if let Some(key) = job.lock {
            if let Some(other) = self.keys.get(&key.raw()) {
                return Err(SyncError::JobRegistry(format!(
                    "jobs '{}' and '{}' share lock key {}",
                    other, job.name, key
                )));
            }
            self.keys.insert(key.raw(), job.name.clone());
        }
        self.jobs.insert(job.name.clone(), job);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

/// Result of one `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { duration: Duration },
    Failed { error: String, duration: Duration },
    /// Still running in the background
    TimedOut { after: Duration },
    SkippedOverlap,
    SkippedLocked,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::TimedOut { .. } => "timed_out",
            JobOutcome::SkippedOverlap => "skipped_overlap",
            JobOutcome::SkippedLocked => "skipped_locked",
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::SkippedOverlap | JobOutcome::SkippedLocked)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Failed { error, .. } => write!(f, "failed: {}", error),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Per-job runtime state
#[derive(Debug, Clone, Default)]
pub struct JobState {
    /// Bodies currently executing in this process (timed-out ones included)
    pub running: u32,
    pub runs: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<&'static str>,
}

/// Clears the running mark when the body is really done
struct RunningGuard {
    state: Arc<DashMap<String, JobState>>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Some(mut s) = self.state.get_mut(&self.name) {
            s.running = s.running.saturating_sub(1);
        }
    }
}

pub struct JobRunner {
    registry: JobRegistry,
    locks: Option<LockManager>,
    state: Arc<DashMap<String, JobState>>,
    metrics: Arc<Metrics>,
}

impl JobRunner {
    /// `locks = None` disables JOB locks for every job (single-process mode)
    pub fn new(registry: JobRegistry, locks: Option<LockManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            locks,
            state: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self, job: &str) -> Option<JobState> {
        self.state.get(job).map(|s| s.clone())
    }

    pub fn is_running(&self, job: &str) -> bool {
        self.state.get(job).is_some_and(|s| s.running > 0)
    }

    /// Any body still executing, timed-out ones included
    pub fn any_running(&self) -> bool {
        self.state.iter().any(|s| s.running > 0)
    }

    /// Run a registered job by name
    pub async fn run_named<F, Fut>(&self, job: &str, body: F) -> Result<JobOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let descriptor = self
            .registry
            .get(job)
            .cloned()
            .ok_or_else(|| SyncError::JobRegistry(format!("unknown job '{}'", job)))?;
        Ok(self.run(&descriptor, body).await)
    }

    pub async fn run<F, Fut>(&self, job: &JobDescriptor, body: F) -> JobOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = job.name.as_str();

        let Some(guard) = self.enter(job) else {
            debug!(job = name, "Previous run still in progress, skipping");
            return self.finish(name, JobOutcome::SkippedOverlap);
        };

        let lock = match (&self.locks, job.lock) {
            (Some(locks), Some(key)) => match locks.try_acquire(key).await {
                Ok(Some(handle)) => Some(handle),
                Ok(None) => {
                    debug!(job = name, "Job lock held elsewhere, skipping");
                    drop(guard);
                    return self.finish(name, JobOutcome::SkippedLocked);
                }
                Err(e) => {
                    error!(job = name, error = %e, "Job lock acquisition failed");
                    drop(guard);
                    return self.finish(
                        name,
                        JobOutcome::Failed {
                            error: e.to_string(),
                            duration: Duration::ZERO,
                        },
                    );
                }
            },
            _ => None,
        };

        self.metrics.record_job_started(name);
        let start = Instant::now();
        let mut handle = tokio::spawn(body());

        match tokio::time::timeout(job.timeout, &mut handle).await {
            Ok(joined) => {
                let outcome = body_outcome(name, joined, start.elapsed());
                self.release(name, lock).await;
                drop(guard);
                self.finish(name, outcome)
            }
            Err(_) => {
                warn!(
                    job = name,
                    timeout_ms = job.timeout.as_millis() as u64,
                    "Job exceeded its timeout, letting it finish in the background"
                );
                let locks = self.locks.clone();
                let metrics = Arc::clone(&self.metrics);
                let state = Arc::clone(&self.state);
                let job_name = name.to_string();
                tokio::spawn(async move {
                    let outcome = body_outcome(&job_name, handle.await, start.elapsed());
                    info!(job = %job_name, outcome = %outcome, "Timed-out job finished");
                    metrics.record_job_finished_after_timeout(&job_name, &outcome);
                    if let Some(mut s) = state.get_mut(&job_name) {
                        s.last_outcome = Some(outcome.as_str());
                    }
                    if let (Some(locks), Some(lock)) = (locks, lock) {
                        let _ = locks.release(lock).await;
                    }
                    drop(guard);
                });
                self.finish(name, JobOutcome::TimedOut { after: job.timeout })
            }
        }
    }

    /// Check-and-mark under the map's shard lock
    fn enter(&self, job: &JobDescriptor) -> Option<RunningGuard> {
        let mut state = self.state.entry(job.name.clone()).or_default();
        if state.running > 0 && job.overlap == OverlapPolicy::SkipIfRunning {
            return None;
        }
        state.running += 1;
        state.runs += 1;
        state.last_started_at = Some(Utc::now());
        Some(RunningGuard {
            state: Arc::clone(&self.state),
            name: job.name.clone(),
        })
    }

    async fn release(&self, job: &str, lock: Option<LockHandle>) {
        if let (Some(locks), Some(lock)) = (&self.locks, lock) {
            if let Err(e) = locks.release(lock).await {
                warn!(job, error = %e, "Job lock release failed");
            }
        }
    }

    fn finish(&self, job: &str, outcome: JobOutcome) -> JobOutcome {
        if let Some(mut s) = self.state.get_mut(job) {
            s.last_outcome = Some(outcome.as_str());
        }
        self.metrics.record_job(job, &outcome);
        outcome
    }
}

/// Map a joined body to its outcome, logging failures
fn body_outcome(
    job: &str,
    joined: std::result::Result<Result<()>, JoinError>,
    duration: Duration,
) -> JobOutcome {
    let duration_ms = duration.as_millis() as u64;
    match joined {
        Ok(Ok(())) => {
            debug!(job, duration_ms, "Job completed");
            JobOutcome::Completed { duration }
        }
        Ok(Err(e)) => {
            error!(job, duration_ms, error = %e, "Job failed");
            JobOutcome::Failed {
                error: e.to_string(),
                duration,
            }
        }
        Err(join) => {
            let reason = if join.is_panic() { "panicked" } else { "cancelled" };
            error!(job, duration_ms, "Job {}", reason);
            JobOutcome::Failed {
                error: format!("job {}", reason),
                duration,
            }
        }
    }
}
