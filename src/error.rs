use thiserror::Error;

/// Main error type for the match synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream error for match {match_id}: {reason}")]
    Upstream { match_id: i64, reason: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Identity / registry errors
    #[error("Invalid match id: {0:?}")]
    InvalidMatchId(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field registry error: {0}")]
    FieldRegistry(String),

    #[error("Job registry error: {0}")]
    JobRegistry(String),

    #[error("Match not found: {0}")]
    MatchNotFound(i64),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
