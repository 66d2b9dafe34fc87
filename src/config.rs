use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::domain::{BoundaryRule, MatchPhase, MatchStatus};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection before failing
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/matchsync".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the pull endpoint (`{base_url}/matches/{id}`)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Source label the drain step writes under
    #[serde(default = "default_upstream_source")]
    pub source: String,
}

fn default_base_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_upstream_source() -> String {
    "api".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout(),
            source: default_upstream_source(),
        }
    }
}

/// Source trust table
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Label -> priority; higher wins
    #[serde(default = "default_priorities")]
    pub priorities: HashMap<String, i32>,
    /// Priority for labels missing from the table
    #[serde(default)]
    pub unknown_priority: i32,
}

fn default_priorities() -> HashMap<String, i32> {
    [
        ("admin", 10),
        ("realtime_recovery", 4),
        ("realtime", 3),
        ("api", 2),
        ("computed", 1),
        ("bulk", 1),
    ]
    .into_iter()
    .map(|(label, p)| (label.to_string(), p))
    .collect()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            priorities: default_priorities(),
            unknown_priority: 0,
        }
    }
}

/// One row of the phase-bucket table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhaseBucketConfig {
    pub phase: MatchPhase,
    /// Enqueue cadence
    pub interval_secs: u64,
    /// Max ids enqueued per tick
    pub batch_limit: usize,
}

impl PhaseBucketConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A phase-transition watcher
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatcherConfig {
    pub name: String,
    pub rule: BoundaryRule,
    pub interval_secs: u64,
    pub batch_limit: usize,
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Drain tick interval in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
    /// Max ids popped per drain tick
    #[serde(default = "default_drain_batch")]
    pub drain_batch_size: usize,
    /// Delay between consecutive upstream calls within a tick
    #[serde(default = "default_inter_call_delay")]
    pub inter_call_delay_ms: u64,
    /// Finished matches stay in the recently-finished bucket this long
    #[serde(default = "default_recently_finished_window")]
    pub recently_finished_window_secs: i64,
    /// Not-started matches enter the pre-start bucket this long before kickoff
    #[serde(default = "default_pre_start_lookahead")]
    pub pre_start_lookahead_secs: i64,
    /// Page size for the full-catalog refresh
    #[serde(default = "default_refresh_page")]
    pub refresh_page_size: usize,
    #[serde(default = "default_buckets")]
    pub buckets: Vec<PhaseBucketConfig>,
    #[serde(default = "default_watchers")]
    pub watchers: Vec<WatcherConfig>,
}

fn default_drain_interval() -> u64 {
    2000
}

fn default_drain_batch() -> usize {
    20
}

fn default_inter_call_delay() -> u64 {
    250
}

fn default_recently_finished_window() -> i64 {
    2 * 3600
}

fn default_pre_start_lookahead() -> i64 {
    3600
}

fn default_refresh_page() -> usize {
    200
}

fn default_buckets() -> Vec<PhaseBucketConfig> {
    vec![
        PhaseBucketConfig {
            phase: MatchPhase::PreStart,
            interval_secs: 60,
            batch_limit: 50,
        },
        PhaseBucketConfig {
            phase: MatchPhase::FirstPeriod,
            interval_secs: 5,
            batch_limit: 40,
        },
        PhaseBucketConfig {
            phase: MatchPhase::Intermission,
            interval_secs: 30,
            batch_limit: 40,
        },
        PhaseBucketConfig {
            phase: MatchPhase::SecondPeriod,
            interval_secs: 5,
            batch_limit: 40,
        },
        PhaseBucketConfig {
            phase: MatchPhase::RecentlyFinished,
            interval_secs: 300,
            batch_limit: 20,
        },
    ]
}

fn default_watchers() -> Vec<WatcherConfig> {
    vec![
        WatcherConfig {
            name: "kickoff_imminent".to_string(),
            rule: BoundaryRule::KickoffWithin { secs: 300 },
            interval_secs: 10,
            batch_limit: 20,
        },
        WatcherConfig {
            name: "first_half_ending".to_string(),
            rule: BoundaryRule::MinuteAtLeast {
                status: MatchStatus::FirstHalf,
                minute: 43,
            },
            interval_secs: 3,
            batch_limit: 20,
        },
        WatcherConfig {
            name: "half_time_ending".to_string(),
            rule: BoundaryRule::StatusHeldFor {
                status: MatchStatus::HalfTime,
                secs: 13 * 60,
            },
            interval_secs: 5,
            batch_limit: 20,
        },
        WatcherConfig {
            name: "full_time_approaching".to_string(),
            rule: BoundaryRule::MinuteAtLeast {
                status: MatchStatus::SecondHalf,
                minute: 88,
            },
            interval_secs: 3,
            batch_limit: 20,
        },
    ]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval(),
            drain_batch_size: default_drain_batch(),
            inter_call_delay_ms: default_inter_call_delay(),
            recently_finished_window_secs: default_recently_finished_window(),
            pre_start_lookahead_secs: default_pre_start_lookahead(),
            refresh_page_size: default_refresh_page(),
            buckets: default_buckets(),
            watchers: default_watchers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Timeout applied to jobs without an override
    #[serde(default = "default_job_timeout")]
    pub default_timeout_secs: u64,
    /// Take JOB-namespace advisory locks so one job runs once across instances
    #[serde(default = "default_true")]
    pub distributed_locks: bool,
    /// Per-job timeout overrides, keyed by job name
    #[serde(default)]
    pub timeouts_secs: HashMap<String, u64>,
    /// How long a graceful shutdown waits for running jobs
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain_secs: u64,
}

fn default_shutdown_drain() -> u64 {
    30
}

fn default_job_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_job_timeout(),
            distributed_locks: true,
            timeouts_secs: HashMap::new(),
            shutdown_drain_secs: default_shutdown_drain(),
        }
    }
}

impl JobsConfig {
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn timeout_for(&self, job: &str) -> Duration {
        Duration::from_secs(
            self.timeouts_secs
                .get(job)
                .copied()
                .unwrap_or(self.default_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Seconds between metrics summary lines (0 disables)
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval() -> u64 {
    60
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            status_interval_secs: default_status_interval(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("MATCHSYNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (MATCHSYNC_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("MATCHSYNC")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single TOML file (CLI `--config`)
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("MATCHSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(database_url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: database_url.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.max_connections < 2 {
            // One connection is pinned by a held lock while the gate reads and writes.
            errors.push("database.max_connections must be at least 2".to_string());
        }

        // Sources
        match self.sources.priorities.get("admin") {
            None => errors.push("sources.priorities must define 'admin'".to_string()),
            Some(admin) => {
                for (label, p) in &self.sources.priorities {
                    if label != "admin" && p >= admin {
                        errors.push(format!("source '{label}' ({p}) must rank below admin ({admin})"));
                    }
                }
            }
        }
        for (label, p) in &self.sources.priorities {
            if *p <= self.sources.unknown_priority {
                errors.push(format!(
                    "source '{label}' ({p}) must outrank unknown_priority ({})",
                    self.sources.unknown_priority
                ));
            }
        }
        if !self.sources.priorities.contains_key(&self.upstream.source) {
            errors.push(format!(
                "upstream.source '{}' has no entry in sources.priorities",
                self.upstream.source
            ));
        }

        // Scheduler
        let s = &self.scheduler;
        if s.drain_interval_ms == 0 {
            errors.push("scheduler.drain_interval_ms must be positive".to_string());
        }
        if s.drain_batch_size == 0 {
            errors.push("scheduler.drain_batch_size must be positive".to_string());
        }
        if s.refresh_page_size == 0 {
            errors.push("scheduler.refresh_page_size must be positive".to_string());
        }
        if s.recently_finished_window_secs < 0 || s.pre_start_lookahead_secs < 0 {
            errors.push("scheduler windows must not be negative".to_string());
        }

        let mut phases = HashSet::new();
        for bucket in &s.buckets {
            if !phases.insert(bucket.phase) {
                errors.push(format!("phase bucket '{}' defined twice", bucket.phase));
            }
            if bucket.interval_secs == 0 || bucket.batch_limit == 0 {
                errors.push(format!(
                    "phase bucket '{}' needs positive interval and batch limit",
                    bucket.phase
                ));
            }
        }

        let mut watcher_names = HashSet::new();
        for watcher in &s.watchers {
            if !watcher_names.insert(watcher.name.as_str()) {
                errors.push(format!("watcher '{}' defined twice", watcher.name));
            }
            if watcher.interval_secs == 0 || watcher.batch_limit == 0 {
                errors.push(format!(
                    "watcher '{}' needs positive interval and batch limit",
                    watcher.name
                ));
            }
        }

        if self.jobs.default_timeout_secs == 0 {
            errors.push("jobs.default_timeout_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
