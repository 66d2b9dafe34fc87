//! Coordination layer
//!
//! - Session-bound advisory locks (JOB and MATCH namespaces)
//! - Job execution: overlap guard, job lock, timeout, metrics
//! - Graceful shutdown

pub mod job_runner;
pub mod lock;
pub mod shutdown;

pub use job_runner::{
    JobDescriptor, JobOutcome, JobRegistry, JobRunner, JobState, OverlapPolicy,
};
pub use lock::{
    LockBackend, LockHandle, LockKey, LockManager, LockNamespace, LockSession, JOB_KEY_SPACE,
    MATCH_KEY_BASE,
};
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken};
