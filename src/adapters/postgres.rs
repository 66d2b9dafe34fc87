//! PostgreSQL adapters
//!
//! `PgLockBackend` maps lock keys onto session-level advisory locks. Each
//! held lock pins the pooled connection it was taken on until release; if a
//! session is dropped unreleased (panic, cancelled future) the connection is
//! detached from the pool and closed, which makes the server drop the lock.
//!
//! `PgMatchStore` reads and writes the `matches` table through the column
//! names in a [`FieldRegistry`]; column identifiers are validated when the
//! registry is built, values always go through bind parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::store::{CandidateQuery, MatchStore, PersistResult};
use crate::config::DatabaseConfig;
use crate::coordination::{LockBackend, LockKey, LockSession};
use crate::domain::{
    AcceptedChange, BoundaryRule, FieldRegistry, FieldSnapshot, FieldValue, MatchField, MatchId,
    MatchPhase, MatchRecord, MatchStatus, NewMatch, Provenance, Source,
};
use crate::error::{Result, SyncError};

/// Open the connection pool
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Run migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

// ==================== Advisory locks ====================

#[derive(Clone)]
pub struct PgLockBackend {
    pool: PgPool,
}

impl PgLockBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for PgLockBackend {
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockSession>>> {
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key.raw())
            .fetch_one(&mut *conn)
            .await?;

        if !locked {
            // Nothing held on this connection; it goes straight back to the pool.
            return Ok(None);
        }

        Ok(Some(Box::new(PgLockSession {
            key: key.raw(),
            conn: Some(conn),
        })))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

struct PgLockSession {
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn release(mut self: Box<Self>) -> Result<bool> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(false);
        };

        let result: std::result::Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await;

        match result {
            Ok(released) => Ok(released),
            Err(e) => {
                // Unknown lock state on this session: never hand it back to the pool.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "Closing lock session that was never released");
            drop(conn.detach());
        }
    }
}

// ==================== Match records ====================

/// `matches` table access
#[derive(Clone)]
pub struct PgMatchStore {
    pool: PgPool,
    registry: FieldRegistry,
}

impl PgMatchStore {
    pub fn new(pool: PgPool, registry: FieldRegistry) -> Self {
        Self { pool, registry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn col(&self, field: MatchField) -> &str {
        &self.registry.columns(field).value
    }

    /// Column used to decide how long the current status has been held
    fn status_since_expr(&self) -> String {
        match &self.registry.columns(MatchField::Status).provenance {
            Some(p) => format!("COALESCE({}, last_modified)", p.timestamp),
            None => "last_modified".to_string(),
        }
    }

    /// `match_id, created_at, last_modified` plus value and provenance
    /// columns of `fields`
    fn push_select<'a>(&self, qb: &mut QueryBuilder<'a, Postgres>, fields: &[MatchField]) {
        qb.push("SELECT match_id, created_at, last_modified, ");
        qb.push(self.col(MatchField::Status));
        for field in fields {
            if *field == MatchField::Status {
                continue;
            }
            qb.push(", ").push(self.col(*field));
        }
        for field in fields {
            if let Some(p) = &self.registry.columns(*field).provenance {
                qb.push(", ").push(&p.source).push(", ").push(&p.timestamp);
            }
        }
        qb.push(" FROM matches WHERE match_id = ");
    }

    fn decode_status(&self, row: &PgRow) -> Result<MatchStatus> {
        let raw: String = row.try_get(self.col(MatchField::Status))?;
        MatchStatus::try_from(raw.as_str()).map_err(SyncError::Internal)
    }

    fn decode_value(&self, row: &PgRow, field: MatchField) -> Result<Option<FieldValue>> {
        let col = self.col(field);
        Ok(match field {
            MatchField::Status => Some(FieldValue::Status(self.decode_status(row)?)),
            MatchField::Minute => Some(FieldValue::Minute(row.try_get::<Option<i32>, _>(col)?)),
            MatchField::HomeScore => Some(FieldValue::HomeScore(row.try_get(col)?)),
            MatchField::AwayScore => Some(FieldValue::AwayScore(row.try_get(col)?)),
            MatchField::KickoffAt => Some(FieldValue::KickoffAt(row.try_get(col)?)),
            MatchField::ProviderUpdatedAt => row
                .try_get::<Option<DateTime<Utc>>, _>(col)?
                .map(FieldValue::ProviderUpdatedAt),
        })
    }

    fn decode_provenance(&self, row: &PgRow, field: MatchField) -> Result<Option<Provenance>> {
        let Some(cols) = &self.registry.columns(field).provenance else {
            return Ok(None);
        };
        let source: Option<String> = row.try_get(cols.source.as_str())?;
        let timestamp: Option<DateTime<Utc>> = row.try_get(cols.timestamp.as_str())?;
        Ok(match (source, timestamp) {
            (Some(source), Some(timestamp)) => Some(Provenance {
                source: Source::new(source),
                timestamp,
            }),
            _ => None,
        })
    }

    fn decode_snapshot(&self, row: &PgRow, fields: &[MatchField]) -> Result<FieldSnapshot> {
        let mut values = HashMap::new();
        let mut provenance = HashMap::new();
        for field in fields {
            if let Some(v) = self.decode_value(row, *field)? {
                values.insert(*field, v);
            }
            if let Some(p) = self.decode_provenance(row, *field)? {
                provenance.insert(*field, p);
            }
        }
        Ok(FieldSnapshot {
            match_id: MatchId::new(row.try_get("match_id")?)?,
            status: self.decode_status(row)?,
            values,
            provenance,
        })
    }

    fn push_value<'a>(qb: &mut QueryBuilder<'a, Postgres>, value: &FieldValue) {
        match value {
            FieldValue::Status(s) => qb.push_bind(s.as_str()),
            FieldValue::Minute(m) => qb.push_bind(*m),
            FieldValue::HomeScore(v) | FieldValue::AwayScore(v) => qb.push_bind(*v),
            FieldValue::KickoffAt(t) | FieldValue::ProviderUpdatedAt(t) => qb.push_bind(*t),
        };
    }

    async fn fetch_ids(&self, mut qb: QueryBuilder<'_, Postgres>, limit: usize) -> Result<Vec<MatchId>> {
        qb.push(" ORDER BY last_modified ASC, match_id ASC LIMIT ")
            .push_bind(limit as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| MatchId::new(r.try_get("match_id")?))
            .collect()
    }

    async fn exists(&self, id: MatchId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT match_id FROM matches WHERE match_id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    #[instrument(skip(self), fields(match_id = %new.match_id))]
    async fn insert_if_absent(&self, new: &NewMatch) -> Result<bool> {
        let now = Utc::now();
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO matches (match_id, ");
        qb.push(self.col(MatchField::Status))
            .push(", ")
            .push(self.col(MatchField::HomeScore))
            .push(", ")
            .push(self.col(MatchField::AwayScore))
            .push(", ")
            .push(self.col(MatchField::KickoffAt))
            .push(", created_at, last_modified) VALUES (");
        qb.push_bind(new.match_id.get())
            .push(", ")
            .push_bind(MatchStatus::NotStarted.as_str())
            .push(", 0, 0, ")
            .push_bind(new.kickoff_at)
            .push(", ")
            .push_bind(now)
            .push(", ")
            .push_bind(now)
            .push(") ON CONFLICT (match_id) DO NOTHING");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: MatchId) -> Result<Option<MatchRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        self.push_select(&mut qb, &MatchField::ALL);
        qb.push_bind(id.get());

        let Some(row) = qb.build().fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let snapshot = self.decode_snapshot(&row, &MatchField::ALL)?;
        let kickoff_at: DateTime<Utc> = row.try_get(self.col(MatchField::KickoffAt))?;
        let mut record = MatchRecord::imported(
            &NewMatch {
                match_id: snapshot.match_id,
                kickoff_at,
            },
            row.try_get("created_at")?,
        );
        for value in snapshot.values.values() {
            record.set(value);
        }
        record.provenance = snapshot.provenance;
        record.last_modified = row.try_get("last_modified")?;
        Ok(Some(record))
    }

    async fn load_fields(&self, id: MatchId, fields: &[MatchField]) -> Result<Option<FieldSnapshot>> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        self.push_select(&mut qb, fields);
        qb.push_bind(id.get());

        match qb.build().fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(self.decode_snapshot(&row, fields)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, changes), fields(fields = changes.len()))]
    async fn persist(
        &self,
        id: MatchId,
        changes: &[AcceptedChange],
        modified_at: DateTime<Utc>,
    ) -> Result<PersistResult> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE matches SET ");
        for change in changes {
            let columns = self.registry.columns(change.field());
            qb.push(&columns.value).push(" = ");
            Self::push_value(&mut qb, &change.value);
            qb.push(", ");

            if let (Some(cols), Some(p)) = (&columns.provenance, &change.provenance) {
                qb.push(&cols.source)
                    .push(" = ")
                    .push_bind(p.source.as_str().to_string())
                    .push(", ")
                    .push(&cols.timestamp)
                    .push(" = ")
                    .push_bind(p.timestamp)
                    .push(", ");
            }
        }
        qb.push("last_modified = ")
            .push_bind(modified_at)
            .push(" WHERE match_id = ")
            .push_bind(id.get());

        let leaves_terminal = changes
            .iter()
            .any(|c| matches!(c.value, FieldValue::Status(s) if !s.is_terminal()));
        if leaves_terminal {
            qb.push(" AND ")
                .push(self.col(MatchField::Status))
                .push(" <> ")
                .push_bind(MatchStatus::Finished.as_str());
        }

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(PersistResult::Written);
        }

        if self.exists(id).await? {
            debug!(%id, "Terminal status guard blocked persist");
            Ok(PersistResult::TerminalGuard)
        } else {
            Ok(PersistResult::Missing)
        }
    }

    async fn phase_candidates(&self, phase: MatchPhase, query: &CandidateQuery) -> Result<Vec<MatchId>> {
        let statuses: Vec<String> = phase.statuses().iter().map(|s| s.as_str().to_string()).collect();

        let mut qb = QueryBuilder::<Postgres>::new("SELECT match_id FROM matches WHERE ");
        qb.push(self.col(MatchField::Status))
            .push(" = ANY(")
            .push_bind(statuses)
            .push(")");
        match phase {
            MatchPhase::PreStart => {
                qb.push(" AND ")
                    .push(self.col(MatchField::KickoffAt))
                    .push(" <= ")
                    .push_bind(query.now + query.pre_start_lookahead);
            }
            MatchPhase::RecentlyFinished => {
                qb.push(" AND last_modified >= ")
                    .push_bind(query.now - query.recently_finished_window);
            }
            _ => {}
        }
        self.fetch_ids(qb, query.limit).await
    }

    async fn boundary_candidates(&self, rule: &BoundaryRule, query: &CandidateQuery) -> Result<Vec<MatchId>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT match_id FROM matches WHERE ");
        let status_col = self.col(MatchField::Status).to_string();
        match rule {
            BoundaryRule::MinuteAtLeast { status, minute } => {
                qb.push(&status_col)
                    .push(" = ")
                    .push_bind(status.as_str())
                    .push(" AND ")
                    .push(self.col(MatchField::Minute))
                    .push(" >= ")
                    .push_bind(*minute);
            }
            BoundaryRule::KickoffWithin { secs } => {
                qb.push(&status_col)
                    .push(" = ")
                    .push_bind(MatchStatus::NotStarted.as_str())
                    .push(" AND ")
                    .push(self.col(MatchField::KickoffAt))
                    .push(" <= ")
                    .push_bind(query.now + chrono::Duration::seconds(*secs));
            }
            BoundaryRule::StatusHeldFor { status, secs } => {
                qb.push(&status_col)
                    .push(" = ")
                    .push_bind(status.as_str())
                    .push(" AND ")
                    .push(self.status_since_expr())
                    .push(" <= ")
                    .push_bind(query.now - chrono::Duration::seconds(*secs));
            }
        }
        self.fetch_ids(qb, query.limit).await
    }

    async fn active_ids(&self, after: Option<MatchId>, limit: usize) -> Result<Vec<MatchId>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT match_id FROM matches WHERE ");
        qb.push(self.col(MatchField::Status))
            .push(" <> ")
            .push_bind(MatchStatus::Finished.as_str());
        if let Some(after) = after {
            qb.push(" AND match_id > ").push_bind(after.get());
        }
        qb.push(" ORDER BY match_id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| MatchId::new(r.try_get("match_id")?))
            .collect()
    }
}
