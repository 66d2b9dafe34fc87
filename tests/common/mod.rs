#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

use matchsync::adapters::{MatchSource, MemoryLockBackend, MemoryMatchStore, UpstreamMatch};
use matchsync::coordination::LockManager;
use matchsync::domain::{FieldRegistry, MatchId, MatchRecord, NewMatch, SourcePriorities};
use matchsync::error::{Result, SyncError};
use matchsync::services::{BroadcastSink, Metrics, WriteGate};
use matchsync::MatchUpdated;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn mid(raw: i64) -> MatchId {
    MatchId::new(raw).unwrap()
}

pub fn fresh_record(raw: i64) -> MatchRecord {
    MatchRecord::imported(
        &NewMatch {
            match_id: mid(raw),
            kickoff_at: ts(0),
        },
        ts(0),
    )
}

/// Upstream that answers from a fixed table, counts calls and records when
/// each call started and ended
#[derive(Default)]
pub struct ScriptedSource {
    answers: Mutex<HashMap<MatchId, UpstreamMatch>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    spans: std::sync::Mutex<Vec<(Instant, Instant)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(started, finished)` per call, in call order
    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.spans.lock().unwrap().clone()
    }

    pub async fn script(&self, id: MatchId, answer: UpstreamMatch) {
        self.answers.lock().await.insert(id, answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchSource for ScriptedSource {
    async fn fetch(&self, match_id: MatchId) -> Result<UpstreamMatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.answers.lock().await.get(&match_id).cloned();
        self.spans.lock().unwrap().push((started, Instant::now()));
        answer.ok_or_else(|| SyncError::Upstream {
            match_id: match_id.get(),
            reason: "not scripted".to_string(),
        })
    }
}

/// Gate over in-memory backends with handles to everything a test inspects
pub struct Harness {
    pub store: Arc<MemoryMatchStore>,
    pub backend: MemoryLockBackend,
    pub locks: LockManager,
    pub events: Arc<BroadcastSink>,
    pub metrics: Arc<Metrics>,
    pub gate: Arc<WriteGate>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryMatchStore::new());
        let backend = MemoryLockBackend::new();
        let locks = LockManager::new(Arc::new(backend.clone()));
        let events = Arc::new(BroadcastSink::new(64));
        let metrics = Arc::new(Metrics::new());
        let gate = Arc::new(WriteGate::new(
            locks.clone(),
            store.clone(),
            FieldRegistry::standard().unwrap(),
            SourcePriorities::default(),
            events.clone(),
            metrics.clone(),
        ));
        Self {
            store,
            backend,
            locks,
            events,
            metrics,
            gate,
        }
    }

    pub fn priorities(&self) -> &SourcePriorities {
        self.gate.priorities()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchUpdated> {
        self.events.subscribe()
    }
}

/// Every event already delivered to `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<MatchUpdated>) -> Vec<MatchUpdated> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
