//! "Match updated" notifications
//!
//! The write gate is the only producer and calls the sink after the persist
//! has committed. Sinks must return quickly; anything slow belongs behind the
//! broadcast sink. Delivery is not transactional with the write, so
//! consumers must tolerate duplicates and gaps.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{FieldValue, MatchField, MatchId, Source};

/// One committed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchUpdated {
    pub match_id: MatchId,
    pub source: Source,
    /// Accepted fields only, in submission order
    pub fields: Vec<MatchField>,
    /// New value of each accepted field, same order as `fields`
    pub values: Vec<FieldValue>,
    pub committed_at: DateTime<Utc>,
}

impl MatchUpdated {
    pub fn value(&self, field: MatchField) -> Option<&FieldValue> {
        self.values.iter().find(|v| v.field() == field)
    }
}

pub trait EventSink: Send + Sync {
    fn on_match_updated(&self, event: &MatchUpdated);
}

/// Writes each event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn on_match_updated(&self, event: &MatchUpdated) {
        let changes: Vec<String> = event
            .values
            .iter()
            .map(|v| format!("{}={}", v.field(), v))
            .collect();
        info!(
            match_id = %event.match_id,
            source = %event.source,
            changes = %changes.join(" "),
            "Match updated"
        );
    }
}

/// Fans events out to in-process subscribers. Slow subscribers lag and
/// lose the oldest events instead of blocking the writer.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MatchUpdated>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchUpdated> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn on_match_updated(&self, event: &MatchUpdated) {
        if self.tx.send(event.clone()).is_err() {
            debug!(match_id = %event.match_id, "No event subscribers");
        }
    }
}

/// Forwards every event to each inner sink in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn on_match_updated(&self, event: &MatchUpdated) {
        for sink in &self.sinks {
            sink.on_match_updated(event);
        }
    }
}
