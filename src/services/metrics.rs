use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::coordination::JobOutcome;

/// Per-job outcome counters
#[derive(Debug, Default)]
pub struct JobCounters {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub skipped_overlap: AtomicU64,
    pub skipped_locked: AtomicU64,
    /// Duration of the last completed or failed run
    pub last_duration_ms: AtomicU64,
}

/// Metrics collector for observability
#[derive(Default)]
pub struct Metrics {
    /// Write batches that persisted at least one field
    pub writes_applied: AtomicU64,
    /// Write batches that found the match lock busy
    pub writes_rejected_locked: AtomicU64,
    /// Write batches refused because the status is terminal
    pub writes_rejected_immutable: AtomicU64,
    /// Write batches where every field lost arbitration
    pub writes_rejected_stale: AtomicU64,
    pub fields_accepted: AtomicU64,
    pub fields_dropped: AtomicU64,
    pub persist_failures: AtomicU64,
    pub events_emitted: AtomicU64,

    /// Ids newly added to the pending set
    pub enqueued: AtomicU64,
    /// Enqueue attempts for ids already pending
    pub enqueue_deduplicated: AtomicU64,
    /// Ids taken off the pending set and processed
    pub reconciled: AtomicU64,
    pub reconcile_errors: AtomicU64,
    pub requeued: AtomicU64,
    /// Pending set size after the last enqueue or drain
    pub pending: AtomicU64,

    jobs: DashMap<String, JobCounters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_pending(&self, len: usize) {
        self.pending.store(len as u64, Ordering::Relaxed);
    }

    /// A job body was spawned
    pub fn record_job_started(&self, job: &str) {
        Self::inc(&self.jobs.entry(job.to_string()).or_default().started);
    }

    /// Record one job run
    pub fn record_job(&self, job: &str, outcome: &JobOutcome) {
        let entry = self.jobs.entry(job.to_string()).or_default();
        let record_duration = |d: &Duration| {
            entry
                .last_duration_ms
                .store(d.as_millis() as u64, Ordering::Relaxed)
        };
        match outcome {
            JobOutcome::Completed { duration } => {
                Self::inc(&entry.completed);
                record_duration(duration);
            }
            JobOutcome::Failed { duration, .. } => {
                Self::inc(&entry.failed);
                record_duration(duration);
            }
            JobOutcome::TimedOut { .. } => Self::inc(&entry.timed_out),
            JobOutcome::SkippedOverlap => Self::inc(&entry.skipped_overlap),
            JobOutcome::SkippedLocked => Self::inc(&entry.skipped_locked),
        }
    }

    /// Real outcome of a body that already counted as timed out. Only
    /// completed and failed runs are recorded; the timeout itself was counted
    /// when it fired.
    pub fn record_job_finished_after_timeout(&self, job: &str, outcome: &JobOutcome) {
        if matches!(outcome, JobOutcome::Completed { .. } | JobOutcome::Failed { .. }) {
            self.record_job(job, outcome);
        }
    }

    /// Snapshot of one job's counters: (completed, failed, timed_out,
    /// skipped_overlap, skipped_locked)
    pub fn job_counts(&self, job: &str) -> (u64, u64, u64, u64, u64) {
        self.jobs
            .get(job)
            .map(|c| {
                (
                    c.completed.load(Ordering::Relaxed),
                    c.failed.load(Ordering::Relaxed),
                    c.timed_out.load(Ordering::Relaxed),
                    c.skipped_overlap.load(Ordering::Relaxed),
                    c.skipped_locked.load(Ordering::Relaxed),
                )
            })
            .unwrap_or_default()
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Get current metrics as a formatted string
    pub fn summary(&self) -> String {
        format!(
            r#"
=== MATCHSYNC STATUS ===
Writes: {} applied | {} locked | {} immutable | {} stale
Fields: {} accepted | {} dropped | Persist failures: {}
Pending: {} | Enqueued: {} (dedup {}) | Reconciled: {} | Errors: {} | Requeued: {}
========================
"#,
            Self::load(&self.writes_applied),
            Self::load(&self.writes_rejected_locked),
            Self::load(&self.writes_rejected_immutable),
            Self::load(&self.writes_rejected_stale),
            Self::load(&self.fields_accepted),
            Self::load(&self.fields_dropped),
            Self::load(&self.persist_failures),
            Self::load(&self.pending),
            Self::load(&self.enqueued),
            Self::load(&self.enqueue_deduplicated),
            Self::load(&self.reconciled),
            Self::load(&self.reconcile_errors),
            Self::load(&self.requeued),
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        let mut out = format!(
            r#"# HELP matchsync_writes_total Write batches by outcome
# TYPE matchsync_writes_total counter
matchsync_writes_total{{outcome="applied"}} {}
matchsync_writes_total{{outcome="rejected_locked"}} {}
matchsync_writes_total{{outcome="rejected_immutable"}} {}
matchsync_writes_total{{outcome="rejected_stale"}} {}

# HELP matchsync_fields_total Field updates by arbitration result
# TYPE matchsync_fields_total counter
matchsync_fields_total{{result="accepted"}} {}
matchsync_fields_total{{result="dropped"}} {}

# HELP matchsync_persist_failures_total Failed persists
# TYPE matchsync_persist_failures_total counter
matchsync_persist_failures_total {}

# HELP matchsync_events_total Post-commit events emitted
# TYPE matchsync_events_total counter
matchsync_events_total {}

# HELP matchsync_enqueued_total Ids added to the pending set
# TYPE matchsync_enqueued_total counter
matchsync_enqueued_total {}

# HELP matchsync_enqueue_deduplicated_total Enqueues of already pending ids
# TYPE matchsync_enqueue_deduplicated_total counter
matchsync_enqueue_deduplicated_total {}

# HELP matchsync_reconciled_total Ids reconciled by the drain
# TYPE matchsync_reconciled_total counter
matchsync_reconciled_total {}

# HELP matchsync_reconcile_errors_total Per-id reconcile failures
# TYPE matchsync_reconcile_errors_total counter
matchsync_reconcile_errors_total {}

# HELP matchsync_requeued_total Ids put back after a busy match lock
# TYPE matchsync_requeued_total counter
matchsync_requeued_total {}

# HELP matchsync_pending Pending set size
# TYPE matchsync_pending gauge
matchsync_pending {}
"#,
            Self::load(&self.writes_applied),
            Self::load(&self.writes_rejected_locked),
            Self::load(&self.writes_rejected_immutable),
            Self::load(&self.writes_rejected_stale),
            Self::load(&self.fields_accepted),
            Self::load(&self.fields_dropped),
            Self::load(&self.persist_failures),
            Self::load(&self.events_emitted),
            Self::load(&self.enqueued),
            Self::load(&self.enqueue_deduplicated),
            Self::load(&self.reconciled),
            Self::load(&self.reconcile_errors),
            Self::load(&self.requeued),
            Self::load(&self.pending),
        );

        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|e| {
                let c = e.value();
                (
                    e.key().clone(),
                    [
                        ("started", Self::load(&c.started)),
                        ("completed", Self::load(&c.completed)),
                        ("failed", Self::load(&c.failed)),
                        ("timed_out", Self::load(&c.timed_out)),
                        ("skipped_overlap", Self::load(&c.skipped_overlap)),
                        ("skipped_locked", Self::load(&c.skipped_locked)),
                    ],
                    Self::load(&c.last_duration_ms),
                )
            })
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));

        if !jobs.is_empty() {
            out.push_str("\n# HELP matchsync_job_runs_total Job starts and outcomes\n");
            out.push_str("# TYPE matchsync_job_runs_total counter\n");
            for (job, counts, _) in &jobs {
                for (outcome, n) in counts {
                    let _ = writeln!(
                        out,
                        "matchsync_job_runs_total{{job=\"{}\",outcome=\"{}\"}} {}",
                        job, outcome, n
                    );
                }
            }
            out.push_str("\n# HELP matchsync_job_last_duration_ms Duration of the last finished run\n");
            out.push_str("# TYPE matchsync_job_last_duration_ms gauge\n");
            for (job, _, ms) in &jobs {
                let _ = writeln!(out, "matchsync_job_last_duration_ms{{job=\"{}\"}} {}", job, ms);
            }
        }

        out
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_outcomes_are_counted_per_job() {
        let metrics = Metrics::new();
        metrics.record_job(
            "reconcile.drain",
            &JobOutcome::Completed {
                duration: Duration::from_millis(12),
            },
        );
        metrics.record_job("reconcile.drain", &JobOutcome::SkippedOverlap);
        metrics.record_job(
            "catalog.refresh",
            &JobOutcome::TimedOut {
                after: Duration::from_secs(1),
            },
        );

        assert_eq!(metrics.job_counts("reconcile.drain"), (1, 0, 0, 1, 0));
        assert_eq!(metrics.job_counts("catalog.refresh"), (0, 0, 1, 0, 0));
        assert_eq!(metrics.job_counts("unknown"), (0, 0, 0, 0, 0));
    }

    #[test]
    fn test_late_finish_after_timeout_records_duration() {
        let metrics = Metrics::new();
        let job = "catalog.refresh";
        metrics.record_job(job, &JobOutcome::TimedOut { after: Duration::from_secs(1) });
        metrics.record_job_finished_after_timeout(
            job,
            &JobOutcome::Failed {
                error: "upstream down".to_string(),
                duration: Duration::from_millis(1_500),
            },
        );
        metrics.record_job_finished_after_timeout(job, &JobOutcome::SkippedOverlap);

        assert_eq!(metrics.job_counts(job), (0, 1, 1, 0, 0));
        assert!(metrics
            .prometheus()
            .contains("matchsync_job_last_duration_ms{job=\"catalog.refresh\"} 1500"));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        Metrics::inc(&metrics.writes_applied);
        metrics.set_pending(3);
        metrics.record_job("watch.kickoff_imminent", &JobOutcome::SkippedLocked);

        let text = metrics.prometheus();
        assert!(text.contains("matchsync_writes_total{outcome=\"applied\"} 1"));
        assert!(text.contains("matchsync_pending 3"));
        assert!(text.contains(
            "matchsync_job_runs_total{job=\"watch.kickoff_imminent\",outcome=\"skipped_locked\"} 1"
        ));
    }
}
