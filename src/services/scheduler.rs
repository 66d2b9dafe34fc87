//! Reconciliation scheduler
//!
//! Phase buckets and boundary watchers select candidate match ids on their
//! own cadences and push them into one deduplicating pending set. A separate
//! drain tick takes at most `drain_batch_size` ids and reconciles them one at
//! a time against the upstream provider, sleeping `inter_call_delay_ms`
//! between calls. Whatever does not fit in a tick waits for the next one.
//!
//! Every tick runs through the [`JobRunner`]:
//! - `enqueue.<phase>` per phase bucket
//! - `watch.<name>` per boundary watcher
//! - `reconcile.drain`
//! - `catalog.refresh` (one-shot)

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::metrics::Metrics;
use super::write_gate::{ApplyOutcome, WriteGate};
use crate::adapters::{CandidateQuery, MatchSource, MatchStore};
use crate::config::{JobsConfig, PhaseBucketConfig, SchedulerConfig, WatcherConfig};
use crate::coordination::{
    JobDescriptor, JobOutcome, JobRegistry, JobRunner, LockManager, ShutdownToken,
};
use crate::domain::{MatchId, MatchPhase, Source};
use crate::error::Result;

pub const DRAIN_JOB: &str = "reconcile.drain";
pub const REFRESH_JOB: &str = "catalog.refresh";

pub fn bucket_job(phase: MatchPhase) -> String {
    format!("enqueue.{}", phase)
}

pub fn watcher_job(name: &str) -> String {
    format!("watch.{}", name)
}

/// A pending match id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileQueueEntry {
    pub match_id: MatchId,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingInner {
    order: VecDeque<ReconcileQueueEntry>,
    members: HashSet<MatchId>,
}

/// FIFO of match ids where each id is present at most once
#[derive(Debug, Default)]
pub struct PendingSet {
    inner: Mutex<PendingInner>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` if the id was already pending
    pub async fn enqueue(&self, match_id: MatchId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(match_id) {
            return false;
        }
        inner.order.push_back(ReconcileQueueEntry {
            match_id,
            enqueued_at: Utc::now(),
        });
        true
    }

    /// Returns how many ids were new
    pub async fn enqueue_all(&self, ids: impl IntoIterator<Item = MatchId>) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut added = 0;
        for match_id in ids {
            if inner.members.insert(match_id) {
                inner.order.push_back(ReconcileQueueEntry {
                    match_id,
                    enqueued_at: now,
                });
                added += 1;
            }
        }
        added
    }

    /// Remove and return up to `n` oldest entries
    pub async fn pop_batch(&self, n: usize) -> Vec<ReconcileQueueEntry> {
        let mut inner = self.inner.lock().await;
        let take = n.min(inner.order.len());
        let batch: Vec<_> = inner.order.drain(..take).collect();
        for entry in &batch {
            inner.members.remove(&entry.match_id);
        }
        batch
    }

    pub async fn contains(&self, match_id: MatchId) -> bool {
        self.inner.lock().await.members.contains(&match_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.order.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ReconcileQueueEntry> {
        self.inner.lock().await.order.iter().copied().collect()
    }
}

/// Tally of one drain tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already in progress; nothing was taken
    pub skipped: bool,
    pub taken: usize,
    pub applied: usize,
    pub stale: usize,
    pub immutable: usize,
    pub locked: usize,
    pub failed: usize,
    pub requeued: usize,
    pub remaining: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied { .. } => self.applied += 1,
            ApplyOutcome::RejectedStale => self.stale += 1,
            ApplyOutcome::RejectedImmutable => self.immutable += 1,
            ApplyOutcome::RejectedLocked => self.locked += 1,
        }
    }
}

/// Tally of one full-catalog refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub visited: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Clears the draining flag on every exit path
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReconciliationScheduler {
    config: SchedulerConfig,
    store: Arc<dyn MatchStore>,
    gate: Arc<WriteGate>,
    upstream: Arc<dyn MatchSource>,
    upstream_source: Source,
    runner: Arc<JobRunner>,
    pending: PendingSet,
    draining: AtomicBool,
    metrics: Arc<Metrics>,
}

impl ReconciliationScheduler {
    /// Registers one job per bucket, per watcher, plus the drain and refresh
    /// jobs. `locks = None` runs every job without a JOB lock.
    pub fn new(
        config: SchedulerConfig,
        jobs: &JobsConfig,
        gate: Arc<WriteGate>,
        upstream: Arc<dyn MatchSource>,
        upstream_source: Source,
        locks: Option<LockManager>,
    ) -> Result<Self> {
        let registry = Self::job_registry(&config, jobs)?;
        let metrics = Arc::clone(gate.metrics());
        let runner = Arc::new(JobRunner::new(registry, locks, Arc::clone(&metrics)));
        Ok(Self {
            store: Arc::clone(gate.store()),
            config,
            gate,
            upstream,
            upstream_source,
            runner,
            pending: PendingSet::new(),
            draining: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn job_registry(config: &SchedulerConfig, jobs: &JobsConfig) -> Result<JobRegistry> {
        let mut registry = JobRegistry::new();
        let mut add = |name: String| {
            let timeout = jobs.timeout_for(&name);
            registry.register(JobDescriptor::new(name, timeout))
        };
        for bucket in &config.buckets {
            add(bucket_job(bucket.phase))?;
        }
        for watcher in &config.watchers {
            add(watcher_job(&watcher.name))?;
        }
        add(DRAIN_JOB.to_string())?;
        add(REFRESH_JOB.to_string())?;
        Ok(registry)
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn query(&self, limit: usize) -> CandidateQuery {
        CandidateQuery {
            now: Utc::now(),
            limit,
            pre_start_lookahead: chrono::Duration::seconds(self.config.pre_start_lookahead_secs),
            recently_finished_window: chrono::Duration::seconds(
                self.config.recently_finished_window_secs,
            ),
        }
    }

    fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.config.inter_call_delay_ms)
    }

    /// Add ids to the pending set; returns how many were new
    pub async fn enqueue(&self, ids: Vec<MatchId>) -> usize {
        let offered = ids.len();
        let added = self.pending.enqueue_all(ids).await;
        Metrics::add(&self.metrics.enqueued, added as u64);
        Metrics::add(&self.metrics.enqueue_deduplicated, (offered - added) as u64);
        self.metrics.set_pending(self.pending.len().await);
        added
    }

    /// Enqueue the oldest-updated matches of one phase bucket
    pub async fn enqueue_phase(&self, bucket: &PhaseBucketConfig) -> Result<usize> {
        let ids = self
            .store
            .phase_candidates(bucket.phase, &self.query(bucket.batch_limit))
            .await?;
        let found = ids.len();
        let added = self.enqueue(ids).await;
        debug!(phase = %bucket.phase, found, added, "Phase bucket enqueued");
        Ok(added)
    }

    /// Enqueue matches about to cross a boundary
    pub async fn enqueue_boundary(&self, watcher: &WatcherConfig) -> Result<usize> {
        let ids = self
            .store
            .boundary_candidates(&watcher.rule, &self.query(watcher.batch_limit))
            .await?;
        let found = ids.len();
        let added = self.enqueue(ids).await;
        debug!(watcher = %watcher.name, rule = %watcher.rule, found, added, "Boundary watcher enqueued");
        Ok(added)
    }

    /// Pull one match from upstream and push it through the write gate
    pub async fn reconcile_one(&self, match_id: MatchId, source: &Source) -> Result<ApplyOutcome> {
        let payload = self.upstream.fetch(match_id).await?;
        let updates = payload.to_updates(match_id, self.gate.priorities(), source, Utc::now())?;
        self.gate.apply(match_id, updates, source).await
    }

    /// One drain tick: take up to `drain_batch_size` ids, reconcile them
    /// serially with the configured delay between calls
    pub async fn drain_once(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress");
            return DrainReport {
                skipped: true,
                remaining: self.pending.len().await,
                ..Default::default()
            };
        }
        let _draining = DrainingGuard(&self.draining);

        let batch = self.pending.pop_batch(self.config.drain_batch_size).await;
        let mut report = DrainReport {
            taken: batch.len(),
            ..Default::default()
        };

        for (i, entry) in batch.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inter_call_delay()).await;
            }
            let match_id = entry.match_id;
            match self.reconcile_one(match_id, &self.upstream_source).await {
                Ok(outcome) => {
                    report.record(&outcome);
                    Metrics::inc(&self.metrics.reconciled);
                    if outcome == ApplyOutcome::RejectedLocked && self.pending.enqueue(match_id).await {
                        report.requeued += 1;
                        Metrics::inc(&self.metrics.requeued);
                    }
                }
                Err(e) => {
                    warn!(%match_id, error = %e, "Reconcile failed, will retry on a later cycle");
                    report.failed += 1;
                    Metrics::inc(&self.metrics.reconcile_errors);
                }
            }
        }

        report.remaining = self.pending.len().await;
        self.metrics.set_pending(report.remaining);
        if report.taken > 0 {
            debug!(
                taken = report.taken,
                applied = report.applied,
                failed = report.failed,
                remaining = report.remaining,
                "Drain tick finished"
            );
        }
        report
    }

    /// Walk every non-terminal match and reconcile it under the bulk source
    pub async fn refresh_catalog(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let mut after: Option<MatchId> = None;
        let page_size = self.config.refresh_page_size;

        loop {
            let page = self.store.active_ids(after, page_size).await?;
            let Some(last) = page.last().copied() else {
                break;
            };

            for match_id in &page {
                if report.visited > 0 {
                    tokio::time::sleep(self.inter_call_delay()).await;
                }
                report.visited += 1;
                match self.reconcile_one(*match_id, &Source::BULK).await {
                    Ok(outcome) if outcome.is_applied() => report.applied += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%match_id, error = %e, "Catalog refresh failed for match");
                        report.failed += 1;
                    }
                }
            }

            if page.len() < page_size {
                break;
            }
            after = Some(last);
        }

        info!(
            visited = report.visited,
            applied = report.applied,
            failed = report.failed,
            "Catalog refresh finished"
        );
        Ok(report)
    }

    /// Run the catalog refresh as a guarded job
    pub async fn run_refresh(self: &Arc<Self>) -> Result<JobOutcome> {
        let this = Arc::clone(self);
        self.runner
            .run_named(REFRESH_JOB, move || async move {
                this.refresh_catalog().await.map(|_| ())
            })
            .await
    }

    /// Spawn one loop per bucket, per watcher and for the drain. Loops exit
    /// when `shutdown` fires; a tick already running is allowed to finish.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for bucket in self.config.buckets.clone() {
            let every = bucket.interval();
            let bucket = Arc::new(bucket);
            handles.push(self.spawn_loop(
                bucket_job(bucket.phase),
                every,
                shutdown.clone(),
                move |s| {
                    let bucket = Arc::clone(&bucket);
                    async move { s.enqueue_phase(&bucket).await.map(|_| ()) }
                },
            ));
        }

        for watcher in self.config.watchers.clone() {
            let every = watcher.interval();
            let watcher = Arc::new(watcher);
            handles.push(self.spawn_loop(
                watcher_job(&watcher.name),
                every,
                shutdown.clone(),
                move |s| {
                    let watcher = Arc::clone(&watcher);
                    async move { s.enqueue_boundary(&watcher).await.map(|_| ()) }
                },
            ));
        }

        handles.push(self.spawn_loop(
            DRAIN_JOB.to_string(),
            Duration::from_millis(self.config.drain_interval_ms),
            shutdown,
            |s| async move {
                s.drain_once().await;
                Ok(())
            },
        ));

        info!(
            buckets = self.config.buckets.len(),
            watchers = self.config.watchers.len(),
            "Reconciliation scheduler started"
        );
        handles
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        job: String,
        every: Duration,
        mut shutdown: ShutdownToken,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => {
                        debug!(job = %job, "Loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let s = Arc::clone(&this);
                        if let Err(e) = this.runner.run_named(&job, || body(s)).await {
                            error!(job = %job, error = %e, "Job could not be run");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(raw: i64) -> MatchId {
        MatchId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_pending_set_deduplicates() {
        let pending = PendingSet::new();
        assert!(pending.enqueue(mid(1)).await);
        assert!(!pending.enqueue(mid(1)).await);
        assert_eq!(pending.enqueue_all([mid(2), mid(1), mid(2), mid(3)]).await, 2);
        assert_eq!(pending.len().await, 3);
    }

    #[tokio::test]
    async fn test_pop_batch_is_fifo_and_frees_ids() {
        let pending = PendingSet::new();
        pending.enqueue_all([mid(5), mid(3), mid(9)]).await;

        let batch = pending.pop_batch(2).await;
        let ids: Vec<_> = batch.iter().map(|e| e.match_id).collect();
        assert_eq!(ids, vec![mid(5), mid(3)]);
        assert!(!pending.contains(mid(5)).await);
        assert!(pending.contains(mid(9)).await);

        // Popped ids can be queued again.
        assert!(pending.enqueue(mid(5)).await);
        assert_eq!(pending.pop_batch(10).await.len(), 2);
        assert!(pending.is_empty().await);
    }

    #[test]
    fn test_default_job_registry_is_valid() {
        let registry =
            ReconciliationScheduler::job_registry(&SchedulerConfig::default(), &JobsConfig::default())
                .unwrap();
        assert!(registry.get(DRAIN_JOB).is_some());
        assert!(registry.get(REFRESH_JOB).is_some());
        assert!(registry.get(&bucket_job(MatchPhase::SecondPeriod)).is_some());
        assert!(registry.get("watch.first_half_ending").is_some());
    }
}
