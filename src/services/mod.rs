pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod write_gate;

pub use events::{BroadcastSink, EventSink, FanoutSink, LoggingSink, MatchUpdated};
pub use metrics::{JobCounters, Metrics};
pub use scheduler::{
    DrainReport, PendingSet, ReconcileQueueEntry, ReconciliationScheduler, RefreshReport,
    DRAIN_JOB, REFRESH_JOB,
};
pub use write_gate::{arbitrate, ApplyOutcome, Arbitration, WriteGate};
