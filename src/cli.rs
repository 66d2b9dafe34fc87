use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::coordination::JobOutcome;
use crate::domain::{FieldValue, MatchField, MatchId, MatchRecord};
use crate::services::ApplyOutcome;

#[derive(Parser)]
#[command(name = "matchsync")]
#[command(version)]
#[command(about = "Write coordination and reconciliation scheduler for live match state", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (defaults to config/default.toml + config/$MATCHSYNC_ENV)
    #[arg(short, long, global = true, env = "MATCHSYNC_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconciliation scheduler until interrupted
    Run,
    /// Apply database migrations
    Migrate,
    /// Administrative correction through the write gate
    Correct {
        /// Match id
        match_id: MatchId,
        /// One or more `field=value` assignments, e.g. `home_score=2 status=FT`
        #[arg(required = true, value_parser = parse_assignment)]
        set: Vec<FieldValue>,
    },
    /// Reconcile every non-terminal match once (bulk priority)
    Refresh,
    /// Print the stored record for a match
    Show {
        /// Match id
        match_id: MatchId,
    },
    /// Create a match record if it does not exist
    Import {
        /// Match id
        match_id: MatchId,
        /// Kickoff time, RFC 3339
        #[arg(long, value_parser = parse_timestamp)]
        kickoff: DateTime<Utc>,
    },
}

/// Parse `field=value`
pub fn parse_assignment(raw: &str) -> Result<FieldValue, String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected field=value, got '{}'", raw))?;
    let field: MatchField = field.trim().parse().map_err(|e| format!("{}", e))?;
    FieldValue::parse(field, value).map_err(|e| e.to_string())
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

pub fn print_record(record: &MatchRecord) {
    println!("\n\x1b[36m=== MATCH {} ===\x1b[0m", record.match_id);
    for field in MatchField::ALL {
        let value = record
            .value(field)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        match record.provenance.get(&field) {
            Some(p) => println!(
                "  {:<20} {:<26} ({} @ {})",
                field,
                value,
                p.source,
                p.timestamp.to_rfc3339()
            ),
            None => println!("  {:<20} {}", field, value),
        }
    }
    println!("  {:<20} {}", "created_at", record.created_at.to_rfc3339());
    println!("  {:<20} {}", "last_modified", record.last_modified.to_rfc3339());
}

pub fn print_apply_outcome(match_id: MatchId, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied { accepted, dropped } => {
            let names = |fields: &[MatchField]| {
                fields.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
            };
            println!("\x1b[32m✓ match {} updated: {}\x1b[0m", match_id, names(accepted));
            if !dropped.is_empty() {
                println!("  dropped: {}", names(dropped));
            }
        }
        other => println!("\x1b[33m✗ match {}: {}\x1b[0m", match_id, other),
    }
}

pub fn print_job_outcome(job: &str, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Completed { duration } => {
            println!("\x1b[32m✓ {} completed in {:?}\x1b[0m", job, duration)
        }
        other => println!("\x1b[33m✗ {}: {}\x1b[0m", job, other),
    }
}
