pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod services;

pub use app::App;
pub use config::AppConfig;
pub use coordination::{
    GracefulShutdown, JobDescriptor, JobOutcome, JobRunner, LockKey, LockManager, ShutdownSignal,
};
pub use domain::{FieldUpdate, FieldValue, MatchField, MatchId, MatchStatus, Source};
pub use error::{Result, SyncError};
pub use services::{
    ApplyOutcome, EventSink, Metrics, MatchUpdated, ReconciliationScheduler, WriteGate,
};
