mod common;

use common::{drain_events, fresh_record, mid, ts, Harness};
use matchsync::domain::{FieldUpdate, FieldValue, MatchField, MatchStatus, Source};
use matchsync::ApplyOutcome;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn stamped(h: &Harness, value: FieldValue, source: &Source, at: i64) -> FieldUpdate {
    h.priorities().stamp(value, source, ts(at))
}

/// A higher-priority value survives a later, newer write from a weaker source.
#[tokio::test]
async fn priority_beats_recency() {
    let h = Harness::new();
    h.store.put(fresh_record(1)).await;

    let live = stamped(&h, FieldValue::Status(MatchStatus::Live), &Source::API, 100);
    let ht = stamped(&h, FieldValue::Status(MatchStatus::HalfTime), &Source::COMPUTED, 200);

    assert!(h.gate.apply(mid(1), vec![live], &Source::API).await.unwrap().is_applied());
    assert_eq!(
        h.gate.apply(mid(1), vec![ht], &Source::COMPUTED).await.unwrap(),
        ApplyOutcome::RejectedStale
    );

    let record = h.gate.store().get(mid(1)).await.unwrap().unwrap();
    assert_eq!(record.status, MatchStatus::Live);
    assert_eq!(record.provenance[&MatchField::Status].source, Source::API);
    assert_eq!(record.provenance[&MatchField::Status].timestamp, ts(100));
}

/// The final state does not depend on arrival order.
#[tokio::test]
async fn arrival_order_does_not_change_outcome() {
    let h = Harness::new();
    h.store.put(fresh_record(1)).await;
    h.store.put(fresh_record(2)).await;

    let live = stamped(&h, FieldValue::Status(MatchStatus::Live), &Source::API, 100);
    let ht = stamped(&h, FieldValue::Status(MatchStatus::HalfTime), &Source::COMPUTED, 200);

    h.gate.apply(mid(1), vec![live.clone()], &Source::API).await.unwrap();
    h.gate.apply(mid(1), vec![ht.clone()], &Source::COMPUTED).await.unwrap();
    h.gate.apply(mid(2), vec![ht], &Source::COMPUTED).await.unwrap();
    h.gate.apply(mid(2), vec![live], &Source::API).await.unwrap();

    let a = h.gate.store().get(mid(1)).await.unwrap().unwrap();
    let b = h.gate.store().get(mid(2)).await.unwrap().unwrap();
    assert_eq!(a.status, MatchStatus::Live);
    assert_eq!(a.status, b.status);
    assert_eq!(a.provenance[&MatchField::Status], b.provenance[&MatchField::Status]);
}

/// Even the admin source cannot move a finished match.
#[tokio::test]
async fn terminal_status_rejects_admin() {
    let h = Harness::new();
    let mut record = fresh_record(7);
    record.status = MatchStatus::Finished;
    record.home_score = 2;
    h.store.put(record.clone()).await;
    let mut rx = h.subscribe();

    let outcome = h
        .gate
        .correct(mid(7), vec![FieldValue::Status(MatchStatus::Live)])
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::RejectedImmutable);
    assert_eq!(h.gate.store().get(mid(7)).await.unwrap().unwrap(), record);
    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(h.metrics.writes_rejected_immutable.load(Ordering::Relaxed), 1);
    assert_eq!(h.backend.held_count(), 0);
}

/// Score corrections still reach a finished match.
#[tokio::test]
async fn terminal_match_accepts_non_status_corrections() {
    let h = Harness::new();
    let mut record = fresh_record(7);
    record.status = MatchStatus::Finished;
    h.store.put(record).await;

    let outcome = h
        .gate
        .correct(mid(7), vec![FieldValue::AwayScore(3)])
        .await
        .unwrap();

    assert!(outcome.is_applied());
    let stored = h.gate.store().get(mid(7)).await.unwrap().unwrap();
    assert_eq!(stored.away_score, 3);
    assert_eq!(stored.status, MatchStatus::Finished);
}

/// Mixed batch: only the winners change and one event names exactly them.
#[tokio::test]
async fn partial_batch_persists_only_winners() {
    let h = Harness::new();
    h.store.put(fresh_record(3)).await;

    // Realtime owns the home score
    let seed = stamped(&h, FieldValue::HomeScore(1), &Source::REALTIME, 500);
    h.gate.apply(mid(3), vec![seed], &Source::REALTIME).await.unwrap();
    let before = h.gate.store().get(mid(3)).await.unwrap().unwrap();
    let mut rx = h.subscribe();

    let batch = vec![
        stamped(&h, FieldValue::Status(MatchStatus::FirstHalf), &Source::API, 600),
        stamped(&h, FieldValue::Minute(Some(12)), &Source::API, 600),
        stamped(&h, FieldValue::HomeScore(0), &Source::API, 600),
    ];
    let outcome = h.gate.apply(mid(3), batch, &Source::API).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            accepted: vec![MatchField::Status, MatchField::Minute],
            dropped: vec![MatchField::HomeScore],
        }
    );

    let after = h.gate.store().get(mid(3)).await.unwrap().unwrap();
    assert_eq!(after.status, MatchStatus::FirstHalf);
    assert_eq!(after.minute, Some(12));
    assert_eq!(after.home_score, before.home_score);
    assert_eq!(
        after.provenance[&MatchField::HomeScore],
        before.provenance[&MatchField::HomeScore]
    );

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].fields, vec![MatchField::Status, MatchField::Minute]);
    assert_eq!(events[0].value(MatchField::HomeScore), None);
}

/// Two writers on one match: the second finds the lock held and backs off.
#[tokio::test]
async fn concurrent_writer_is_rejected_locked() {
    let h = Harness::new();
    h.store.put(fresh_record(9)).await;
    h.store.set_persist_delay(Some(Duration::from_millis(300))).await;

    let first = {
        let gate = h.gate.clone();
        let update = stamped(&h, FieldValue::HomeScore(1), &Source::REALTIME, 10);
        tokio::spawn(async move { gate.apply(mid(9), vec![update], &Source::REALTIME).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = stamped(&h, FieldValue::AwayScore(1), &Source::API, 11);
    let outcome = h.gate.apply(mid(9), vec![second], &Source::API).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::RejectedLocked);

    assert!(first.await.unwrap().unwrap().is_applied());
    let record = h.gate.store().get(mid(9)).await.unwrap().unwrap();
    assert_eq!(record.home_score, 1);
    assert_eq!(record.away_score, 0);
    assert_eq!(h.backend.held_count(), 0);
}

/// Different matches never contend.
#[tokio::test]
async fn writers_on_different_matches_both_apply() {
    let h = Harness::new();
    h.store.put(fresh_record(10)).await;
    h.store.put(fresh_record(11)).await;
    h.store.set_persist_delay(Some(Duration::from_millis(100))).await;

    let a = stamped(&h, FieldValue::HomeScore(1), &Source::API, 1);
    let b = stamped(&h, FieldValue::HomeScore(2), &Source::API, 1);
    let (ra, rb) = tokio::join!(
        h.gate.apply(mid(10), vec![a], &Source::API),
        h.gate.apply(mid(11), vec![b], &Source::API),
    );
    assert!(ra.unwrap().is_applied());
    assert!(rb.unwrap().is_applied());
}

/// Equal priority and equal timestamp: the resubmission wins.
#[tokio::test]
async fn equal_priority_equal_timestamp_overwrites() {
    let h = Harness::new();
    h.store.put(fresh_record(4)).await;

    let first = stamped(&h, FieldValue::Minute(Some(30)), &Source::API, 100);
    let again = stamped(&h, FieldValue::Minute(Some(31)), &Source::API, 100);
    h.gate.apply(mid(4), vec![first], &Source::API).await.unwrap();
    let outcome = h.gate.apply(mid(4), vec![again], &Source::API).await.unwrap();

    assert!(outcome.is_applied());
    assert_eq!(h.gate.store().get(mid(4)).await.unwrap().unwrap().minute, Some(31));
}

/// A failed persist emits nothing and frees the match for the next writer.
#[tokio::test]
async fn persist_failure_releases_lock_without_event() {
    let h = Harness::new();
    h.store.put(fresh_record(5)).await;
    h.store.set_fail_persists(true);
    let mut rx = h.subscribe();

    let update = stamped(&h, FieldValue::HomeScore(1), &Source::API, 1);
    assert_err!(h.gate.apply(mid(5), vec![update.clone()], &Source::API).await);
    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(h.backend.held_count(), 0);

    h.store.set_fail_persists(false);
    let outcome = assert_ok!(h.gate.apply(mid(5), vec![update], &Source::API).await);
    assert!(outcome.is_applied());
    assert_eq!(drain_events(&mut rx).len(), 1);
}

/// Rank comes from the source label, whatever priority the caller attached.
#[tokio::test]
async fn caller_priority_cannot_outrank_source_table() {
    let h = Harness::new();
    h.store.put(fresh_record(12)).await;

    let first = FieldUpdate::new(FieldValue::HomeScore(5), Source::API, 5, ts(100));
    let inflated = FieldUpdate::new(FieldValue::HomeScore(1), Source::COMPUTED, 3, ts(200));

    assert!(h.gate.apply(mid(12), vec![first], &Source::API).await.unwrap().is_applied());
    assert_eq!(
        h.gate.apply(mid(12), vec![inflated], &Source::COMPUTED).await.unwrap(),
        ApplyOutcome::RejectedStale
    );

    let record = h.gate.store().get(mid(12)).await.unwrap().unwrap();
    assert_eq!(record.home_score, 5);
    assert_eq!(record.provenance[&MatchField::HomeScore].source, Source::API);
}

/// A fully outranked poll writes nothing, not even its provider timestamp.
#[tokio::test]
async fn outranked_poll_leaves_provider_timestamp_alone() {
    let h = Harness::new();
    h.store.put(fresh_record(13)).await;

    let seed = vec![
        stamped(&h, FieldValue::HomeScore(2), &Source::REALTIME, 500),
        stamped(&h, FieldValue::ProviderUpdatedAt(ts(500)), &Source::REALTIME, 500),
    ];
    assert!(h.gate.apply(mid(13), seed, &Source::REALTIME).await.unwrap().is_applied());
    let before = h.gate.store().get(mid(13)).await.unwrap().unwrap();
    let mut rx = h.subscribe();

    let poll = vec![
        stamped(&h, FieldValue::HomeScore(1), &Source::API, 100),
        stamped(&h, FieldValue::ProviderUpdatedAt(ts(100)), &Source::API, 100),
    ];
    let outcome = h.gate.apply(mid(13), poll, &Source::API).await.unwrap();

    assert_eq!(outcome, ApplyOutcome::RejectedStale);
    let after = h.gate.store().get(mid(13)).await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(after.provider_updated_at, Some(ts(500)));
    assert!(drain_events(&mut rx).is_empty());
}
