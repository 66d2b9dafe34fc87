use matchsync::adapters::MemoryLockBackend;
use matchsync::coordination::{
    JobDescriptor, JobOutcome, JobRegistry, JobRunner, LockKey, LockManager, OverlapPolicy,
};
use matchsync::domain::MatchId;
use matchsync::services::Metrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn runner(jobs: Vec<JobDescriptor>, locks: Option<LockManager>) -> Arc<JobRunner> {
    let mut registry = JobRegistry::new();
    for job in jobs {
        registry.register(job).unwrap();
    }
    Arc::new(JobRunner::new(registry, locks, Arc::new(Metrics::new())))
}

/// A second invocation while the first is still running is skipped.
#[tokio::test]
async fn overlapping_run_is_skipped() {
    let backend = MemoryLockBackend::new();
    let r = runner(
        vec![JobDescriptor::new("enqueue.first_period", Duration::from_secs(5))],
        Some(LockManager::new(Arc::new(backend.clone()))),
    );

    let first = {
        let r = r.clone();
        tokio::spawn(async move {
            r.run_named("enqueue.first_period", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = r
        .run_named("enqueue.first_period", || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(second, JobOutcome::SkippedOverlap);
    assert!(matches!(first.await.unwrap().unwrap(), JobOutcome::Completed { .. }));
    assert!(!r.is_running("enqueue.first_period"));
    assert_eq!(backend.held_count(), 0);
}

/// The timeout reports and moves on; the body still runs to completion and
/// the job stays guarded until it does.
#[tokio::test]
async fn timeout_does_not_cancel_body() {
    let backend = MemoryLockBackend::new();
    let r = runner(
        vec![JobDescriptor::new("catalog.refresh", Duration::from_millis(50))],
        Some(LockManager::new(Arc::new(backend.clone()))),
    );
    let finished = Arc::new(AtomicBool::new(false));

    let flag = finished.clone();
    let outcome = assert_ok!(
        r.run_named("catalog.refresh", move || async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
    );

    assert!(matches!(outcome, JobOutcome::TimedOut { .. }));
    assert!(!finished.load(Ordering::SeqCst));
    assert!(r.is_running("catalog.refresh"));
    assert_eq!(
        r.run_named("catalog.refresh", || async { Ok(()) }).await.unwrap(),
        JobOutcome::SkippedOverlap
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(finished.load(Ordering::SeqCst));
    assert!(!r.is_running("catalog.refresh"));
    assert_eq!(backend.held_count(), 0);
    // (completed, failed, timed_out, skipped_overlap, skipped_locked)
    assert_eq!(r.metrics().job_counts("catalog.refresh"), (1, 0, 1, 1, 0));
}

/// Concurrent-allowed jobs run side by side without a lock.
#[tokio::test]
async fn concurrent_policy_allows_parallel_runs() {
    let r = runner(
        vec![JobDescriptor::new("adhoc", Duration::from_secs(1))
            .local()
            .with_overlap(OverlapPolicy::AllowConcurrent)],
        None,
    );
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    };
    let (a, b) = tokio::join!(r.run_named("adhoc", slow), r.run_named("adhoc", slow));
    assert!(matches!(a.unwrap(), JobOutcome::Completed { .. }));
    assert!(matches!(b.unwrap(), JobOutcome::Completed { .. }));
}

/// Match locks are exclusive per id and freed when the handle is dropped.
#[tokio::test]
async fn dropped_handle_releases_match_lock() {
    let backend = MemoryLockBackend::new();
    let locks = LockManager::new(Arc::new(backend.clone()));
    let id = MatchId::new(1_035_042).unwrap();

    let handle = locks.try_acquire_match(id).await.unwrap().unwrap();
    assert!(locks.try_acquire_match(id).await.unwrap().is_none());
    assert!(backend.is_held(LockKey::for_match(id).unwrap()));

    // A different match is independent
    let other = locks
        .try_acquire_match(MatchId::new(7).unwrap())
        .await
        .unwrap();
    assert!(other.is_some());

    drop(handle);
    assert!(locks.try_acquire_match(id).await.unwrap().is_some());
}

/// Job and match keys never collide, whatever the name or id.
#[test]
fn job_and_match_namespaces_are_disjoint() {
    let job = LockKey::for_job("reconcile.drain");
    let smallest_match = LockKey::for_match(MatchId::new(1).unwrap()).unwrap();
    assert!(job.raw() < smallest_match.raw());
    assert_err!(LockKey::for_raw_match_id("-1"));
    assert_err!(LockKey::for_raw_match_id("12ab"));
    assert_ne!(job.namespace(), smallest_match.namespace());
}
