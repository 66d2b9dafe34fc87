//! Graceful shutdown
//!
//! Scheduler loops hold a [`ShutdownToken`] and stop ticking once shutdown is
//! requested. The runtime then gives in-flight jobs a bounded window to
//! finish; a job body is never cancelled mid-write.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT
    Graceful,
    /// SIGQUIT; skip the drain window
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Loops stop scheduling new ticks
    StoppingLoops,
    /// Waiting for running jobs
    DrainingJobs,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingLoops => write!(f, "stopping_loops"),
            ShutdownPhase::DrainingJobs => write!(f, "draining_jobs"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown coordinator
pub struct GracefulShutdown {
    drain_timeout: Duration,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            drain_timeout,
            signal_tx,
            phase_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30))
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_tx.borrow().is_some()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// First request wins; later ones are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let accepted = self.signal_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
        if accepted {
            info!("Shutdown requested: {}", signal);
        } else {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    /// Stop the loops, then wait up to the drain timeout for `drain` (usually
    /// "no job running") to report completion. Returns whether it drained.
    pub async fn execute<F, Fut>(&self, stop_loops: impl FnOnce(), drain: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let start = Instant::now();

        self.set_phase(ShutdownPhase::StoppingLoops);
        stop_loops();

        let urgent = *self.signal_tx.borrow() == Some(ShutdownSignal::Urgent);
        let drained = if urgent {
            warn!("Urgent shutdown, not waiting for running jobs");
            false
        } else {
            self.set_phase(ShutdownPhase::DrainingJobs);
            match tokio::time::timeout(self.drain_timeout, drain()).await {
                Ok(()) => {
                    debug!("Running jobs drained");
                    true
                }
                Err(_) => {
                    warn!(
                        "Job drain timeout after {:?}, proceeding anyway",
                        self.drain_timeout
                    );
                    false
                }
            }
        };

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());
        drained
    }
}

/// Cloneable shutdown observer for long-running tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolve once shutdown is requested (immediately if it already was)
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator gone
                return ShutdownSignal::Urgent;
            }
        }
    }
}

/// Forward SIGTERM/SIGINT (graceful) and SIGQUIT (urgent) to `shutdown`
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, sig) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(sig);
                    });
                }
                Err(e) => error!("Failed to install {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}
