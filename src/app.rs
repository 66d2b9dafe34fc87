//! Process wiring: store, locks, gate, scheduler and the daemon loop

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::{
    postgres, HttpMatchSource, MatchSource, MatchStore, PgLockBackend, PgMatchStore,
};
use crate::config::AppConfig;
use crate::coordination::{GracefulShutdown, LockBackend, LockManager, ShutdownToken};
use crate::domain::{FieldRegistry, Source, SourcePriorities};
use crate::error::{Result, SyncError};
use crate::services::{
    BroadcastSink, FanoutSink, LoggingSink, Metrics, ReconciliationScheduler, WriteGate,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything a running instance shares
pub struct App {
    pub config: AppConfig,
    pub locks: LockManager,
    pub gate: Arc<WriteGate>,
    pub scheduler: Arc<ReconciliationScheduler>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<BroadcastSink>,
}

impl App {
    /// Validate the config, connect to Postgres and build the Postgres-backed app
    pub async fn connect(config: AppConfig) -> Result<Self> {
        validate(&config)?;

        let pool = postgres::connect(&config.database).await?;
        let store = Arc::new(PgMatchStore::new(pool.clone(), FieldRegistry::standard()?));
        let lock_backend = Arc::new(PgLockBackend::new(pool));
        let upstream = Arc::new(HttpMatchSource::new(&config.upstream)?);

        Self::build(config, store, lock_backend, upstream)
    }

    /// Build against arbitrary backends
    pub fn build(
        config: AppConfig,
        store: Arc<dyn MatchStore>,
        lock_backend: Arc<dyn LockBackend>,
        upstream: Arc<dyn MatchSource>,
    ) -> Result<Self> {
        let priorities = SourcePriorities::from_config(&config.sources)?;
        let registry = FieldRegistry::standard()?;
        let locks = LockManager::new(lock_backend);
        let metrics = Arc::new(Metrics::new());

        let events = Arc::new(BroadcastSink::new(EVENT_CHANNEL_CAPACITY));
        let sink = FanoutSink::new()
            .with(Arc::new(LoggingSink))
            .with(events.clone());

        let gate = Arc::new(WriteGate::new(
            locks.clone(),
            store,
            registry,
            priorities,
            Arc::new(sink),
            metrics.clone(),
        ));

        let job_locks = config.jobs.distributed_locks.then(|| locks.clone());
        let scheduler = Arc::new(ReconciliationScheduler::new(
            config.scheduler.clone(),
            &config.jobs,
            gate.clone(),
            upstream,
            Source::new(config.upstream.source.clone()),
            job_locks,
        )?);

        info!(
            lock_backend = locks.backend_name(),
            distributed_job_locks = config.jobs.distributed_locks,
            jobs = scheduler.runner().registry().len(),
            "Application wired"
        );

        Ok(Self {
            config,
            locks,
            gate,
            scheduler,
            metrics,
            events,
        })
    }

    /// Run the scheduler loops until `shutdown` fires, then wait for
    /// in-flight jobs within the drain timeout.
    pub async fn run(&self, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        let mut token = shutdown.token();
        let mut handles = self.scheduler.start(token.clone());
        if let Some(status) = self.spawn_status_loop(token.clone()) {
            handles.push(status);
        }

        let signal = token.wait_for_shutdown().await;
        info!(%signal, "Shutting down");

        let runner = Arc::clone(self.scheduler.runner());
        let drained = shutdown
            .execute(
                || debug!("Scheduler loops observe the shutdown token"),
                || async move {
                    for handle in handles {
                        if let Err(e) = handle.await {
                            warn!("Scheduler loop ended abnormally: {}", e);
                        }
                    }
                    // Timed-out bodies keep running detached from their loop
                    while runner.any_running() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            )
            .await;

        self.metrics.log_status();
        if !drained {
            warn!("Exiting with jobs still running");
        }
        Ok(())
    }

    fn spawn_status_loop(&self, mut shutdown: ShutdownToken) -> Option<JoinHandle<()>> {
        let every = self.config.logging.status_interval_secs;
        if every == 0 {
            return None;
        }
        let metrics = self.metrics.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(every));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = ticker.tick() => metrics.log_status(),
                }
            }
        }))
    }
}

/// Collapse config validation errors into one error
pub fn validate(config: &AppConfig) -> Result<()> {
    config
        .validate()
        .map_err(|errors| SyncError::Validation(errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryLockBackend, MemoryMatchStore, MockMatchSource};
    use crate::coordination::ShutdownSignal;

    fn app(config: AppConfig) -> App {
        App::build(
            config,
            Arc::new(MemoryMatchStore::new()),
            Arc::new(MemoryLockBackend::new()),
            Arc::new(MockMatchSource::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_registers_every_job() {
        let app = app(AppConfig::default());
        let names: Vec<&str> = app.scheduler.runner().registry().names().collect();
        assert!(names.contains(&"reconcile.drain"));
        assert!(names.contains(&"catalog.refresh"));
        assert_eq!(app.locks.backend_name(), "memory");
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let mut config = AppConfig::default();
        config.database.max_connections = 1;
        config.sources.priorities.insert("realtime".into(), 99);
        match validate(&config) {
            Err(SyncError::Validation(msg)) => {
                assert!(msg.contains("max_connections"));
                assert!(msg.contains("realtime"));
            }
            other => panic!("expected validation error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let mut config = AppConfig::default();
        config.logging.status_interval_secs = 0;
        let app = app(config);
        let shutdown = Arc::new(GracefulShutdown::new(Duration::from_secs(2)));

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.request_shutdown(ShutdownSignal::Graceful);
        });

        tokio::time::timeout(Duration::from_secs(5), app.run(shutdown.clone()))
            .await
            .expect("run did not stop")
            .unwrap();
        assert!(!app.scheduler.runner().any_running());
    }
}
