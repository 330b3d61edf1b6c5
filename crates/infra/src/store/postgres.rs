//! Postgres-backed job and dead-letter store.
//!
//! ## Concurrency
//!
//! - `claim_next` selects with `FOR UPDATE SKIP LOCKED` and flips the row to
//!   `active` in the same statement, so two orchestrator processes never claim
//!   the same job.
//! - `insert_within_capacity` counts and inserts inside one transaction
//!   holding a transaction-scoped advisory lock; concurrent submitters are
//!   serialised on that lock only.
//! - `requeue_dead_letter` takes the same advisory lock, then deletes the
//!   entry and inserts its fresh job in one transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Storage` (callers map it to `AlreadyExists` where meaningful) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::instrument;

use conductor_core::{
    AttemptRecord, CorrelationId, DeadLetterEntry, DeadLetterFilter, DeadLetterId, ErrorKind, Job,
    JobError, JobId, JobStatus, Priority,
};

use super::{Admission, DeadLetterStorage, JobStore, QueueDepth, Requeue, StoreError};

/// Advisory lock key serialising capacity-checked inserts.
const CAPACITY_LOCK_KEY: i64 = 0x636f_6e64_7563_746f;

const JOB_COLUMNS: &str = r#"
    id, dependency, priority, payload, status, attempts, max_attempts,
    next_attempt_at, correlation_id, created_at, updated_at, claimed_at,
    last_error, history
"#;

const DEAD_LETTER_COLUMNS: &str = r#"
    id, job_id, dependency, priority, payload, attempts, max_attempts,
    last_error, history, correlation_id, first_failed_at, dead_lettered_at
"#;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conductor_jobs (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        dependency TEXT NOT NULL,
        priority SMALLINT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL CHECK (attempts >= 0),
        max_attempts INTEGER NOT NULL CHECK (max_attempts > 0),
        next_attempt_at TIMESTAMPTZ NOT NULL,
        correlation_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        claimed_at TIMESTAMPTZ,
        last_error JSONB,
        history JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_jobs_ready_idx
        ON conductor_jobs (priority, created_at, seq)
        WHERE status IN ('queued', 'retry_scheduled')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_jobs_status_idx
        ON conductor_jobs (status, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conductor_dead_letters (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL,
        dependency TEXT NOT NULL,
        priority SMALLINT NOT NULL,
        payload JSONB NOT NULL,
        attempts INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        error_kind TEXT NOT NULL,
        last_error JSONB NOT NULL,
        history JSONB NOT NULL DEFAULT '[]'::jsonb,
        correlation_id TEXT NOT NULL,
        first_failed_at TIMESTAMPTZ NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_dead_letters_time_idx
        ON conductor_dead_letters (dead_lettered_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_dead_letters_job_idx
        ON conductor_dead_letters (job_id)
    "#,
];

/// Durable store shared by every orchestrator process pointed at the same
/// database.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, dependency = %job.dependency), err)]
    async fn insert_within_capacity(&self, job: &Job, limit: usize) -> Result<Admission, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let in_flight = lock_and_count_in_flight(&mut tx).await?;
        if in_flight >= limit {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Admission::Rejected { in_flight });
        }

        insert_job(&mut tx, job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Admission::Accepted)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE conductor_jobs
            SET status = 'active', attempts = attempts + 1, claimed_at = $1, updated_at = $1
            WHERE id = (
                SELECT id FROM conductor_jobs
                WHERE status IN ('queued', 'retry_scheduled') AND next_attempt_at <= $1
                ORDER BY priority ASC, created_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM conductor_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update_claimed(&self, job: &Job, claimed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let history = to_json(&job.history)?;
        let last_error = job.last_error.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE conductor_jobs
            SET status = $2, attempts = $3, next_attempt_at = $4, updated_at = $5,
                claimed_at = $6, last_error = $7, history = $8
            WHERE id = $1 AND status = 'active' AND claimed_at = $9
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.next_attempt_at)
        .bind(job.updated_at)
        .bind(job.claimed_at)
        .bind(last_error)
        .bind(history)
        .bind(claimed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_claimed", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conductor_jobs WHERE id = $1)")
                .bind(job.id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("check_job_exists", e))?;

        if exists {
            Err(StoreError::ClaimLost(job.id))
        } else {
            Err(StoreError::NotFound(job.id))
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conductor_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn depth(&self) -> Result<QueueDepth, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM conductor_jobs
            WHERE status IN ('queued', 'retry_scheduled', 'active')
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("depth", e))?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("depth", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("depth", e))?;
            let total = total.max(0) as usize;
            match parse_status(&status)? {
                JobStatus::Queued => depth.queued = total,
                JobStatus::RetryScheduled => depth.retry_scheduled = total,
                JobStatus::Active => depth.active = total,
                JobStatus::Completed | JobStatus::DeadLettered => {}
            }
        }
        Ok(depth)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE conductor_jobs
            SET status = 'queued', attempts = GREATEST(attempts - 1, 0),
                next_attempt_at = $2, claimed_at = NULL, updated_at = $2
            WHERE status = 'active' AND (claimed_at IS NULL OR claimed_at < $1)
            RETURNING id
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM conductor_jobs WHERE status = 'completed' AND updated_at < $1")
                .bind(before)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge_completed", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeadLetterStorage for PostgresStore {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, job_id = %entry.job_id), err)]
    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO conductor_dead_letters ({DEAD_LETTER_COLUMNS}, error_kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(entry.id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(&entry.dependency)
        .bind(entry.priority.rank())
        .bind(&entry.payload)
        .bind(entry.attempts as i32)
        .bind(entry.max_attempts as i32)
        .bind(to_json(&entry.last_error)?)
        .bind(to_json(&entry.history)?)
        .bind(entry.correlation_id.as_str())
        .bind(entry.first_failed_at)
        .bind(entry.dead_lettered_at)
        .bind(entry.last_error.kind.as_str())
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DeadLetterExists(entry.id)),
            Err(e) => Err(map_sqlx_error("insert_dead_letter", e)),
        }
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM conductor_dead_letters WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find_dead_letter_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM conductor_dead_letters \
             WHERE job_id = $1 ORDER BY dead_lettered_at DESC LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_dead_letter_by_job", e))?;

        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let limit = filter.limit.map(|l| l.min(i64::MAX as usize) as i64);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM conductor_dead_letters
            WHERE ($1::text IS NULL OR dependency = $1)
                AND ($2::text IS NULL OR error_kind = $2)
                AND ($3::timestamptz IS NULL OR dead_lettered_at >= $3)
                AND ($4::timestamptz IS NULL OR dead_lettered_at < $4)
            ORDER BY dead_lettered_at DESC
            LIMIT $5
            "#
        ))
        .bind(filter.dependency.as_deref())
        .bind(filter.error_kind.map(ErrorKind::as_str))
        .bind(filter.since)
        .bind(filter.until)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Requeue, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let in_flight = lock_and_count_in_flight(&mut tx).await?;

        let row = sqlx::query(&format!(
            "DELETE FROM conductor_dead_letters WHERE id = $1 RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("take_dead_letter", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Requeue::Missing);
        };
        if in_flight >= limit {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Requeue::Rejected { in_flight });
        }

        let entry = dead_letter_from_row(&row)?;
        let job = entry.to_fresh_job(now);
        insert_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Requeue::Requeued { entry, job })
    }

    #[instrument(skip(self), err)]
    async fn count_dead_letters_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conductor_dead_letters WHERE dead_lettered_at >= $1",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_dead_letters", e))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn purge_dead_letters_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM conductor_dead_letters WHERE dead_lettered_at < $1")
            .bind(before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_dead_letters", e))?;
        Ok(result.rows_affected())
    }
}

/// Take the capacity lock for the rest of the transaction and count
/// unfinished jobs.
async fn lock_and_count_in_flight(conn: &mut PgConnection) -> Result<usize, StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CAPACITY_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("capacity_lock", e))?;

    let in_flight: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM conductor_jobs
        WHERE status IN ('queued', 'retry_scheduled', 'active')
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("count_in_flight", e))?;

    Ok(in_flight.max(0) as usize)
}

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<(), StoreError> {
    let history = to_json(&job.history)?;
    let last_error = job.last_error.as_ref().map(to_json).transpose()?;

    let inserted = sqlx::query(&format!(
        "INSERT INTO conductor_jobs ({JOB_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    ))
    .bind(job.id.as_uuid())
    .bind(&job.dependency)
    .bind(job.priority.rank())
    .bind(&job.payload)
    .bind(job.status.as_str())
    .bind(job.attempts as i32)
    .bind(job.max_attempts as i32)
    .bind(job.next_attempt_at)
    .bind(job.correlation_id.as_str())
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.claimed_at)
    .bind(last_error)
    .bind(history)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(job.id)),
        Err(e) => Err(map_sqlx_error("insert_job", e)),
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {} ({}): {}",
            operation,
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn parse_status(status: &str) -> Result<JobStatus, StoreError> {
    status
        .parse()
        .map_err(|e: conductor_core::DomainError| StoreError::Corrupt(e.to_string()))
}

fn parse_priority(rank: i16) -> Result<Priority, StoreError> {
    Priority::from_rank(rank).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn parse_correlation_id(raw: String) -> Result<CorrelationId, StoreError> {
    CorrelationId::new(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    dependency: String,
    priority: i16,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    correlation_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<serde_json::Value>,
    history: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            dependency: row.try_get("dependency")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            claimed_at: row.try_get("claimed_at")?,
            last_error: row.try_get("last_error")?,
            history: row.try_get("history")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            dependency: row.dependency,
            priority: parse_priority(row.priority)?,
            payload: row.payload,
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            next_attempt_at: row.next_attempt_at,
            correlation_id: parse_correlation_id(row.correlation_id)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            claimed_at: row.claimed_at,
            last_error: row
                .last_error
                .map(|v| from_json::<JobError>(v, "last_error"))
                .transpose()?,
            history: from_json::<Vec<AttemptRecord>>(row.history, "history")?,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

#[derive(Debug)]
struct DeadLetterRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    dependency: String,
    priority: i16,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    last_error: serde_json::Value,
    history: serde_json::Value,
    correlation_id: String,
    first_failed_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for DeadLetterRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            dependency: row.try_get("dependency")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            history: row.try_get("history")?,
            correlation_id: row.try_get("correlation_id")?,
            first_failed_at: row.try_get("first_failed_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterEntry {
            id: DeadLetterId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            dependency: row.dependency,
            priority: parse_priority(row.priority)?,
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            last_error: from_json(row.last_error, "last_error")?,
            history: from_json(row.history, "history")?,
            correlation_id: parse_correlation_id(row.correlation_id)?,
            first_failed_at: row.first_failed_at,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
    DeadLetterRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_dead_letter", e))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_with_unknown_status_is_corrupt() {
        assert!(matches!(parse_status("paused"), Err(StoreError::Corrupt(_))));
        assert!(matches!(parse_priority(9), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn job_row_converts_to_job() {
        let now = Utc::now();
        let row = JobRow {
            id: uuid::Uuid::now_v7(),
            dependency: "ai-provider".into(),
            priority: 0,
            payload: serde_json::json!({"prompt": "hi"}),
            status: "retry_scheduled".into(),
            attempts: 2,
            max_attempts: 5,
            next_attempt_at: now,
            correlation_id: "req-1".into(),
            created_at: now,
            updated_at: now,
            claimed_at: None,
            last_error: Some(serde_json::json!({"kind": "transient", "message": "429"})),
            history: serde_json::json!([]),
        };

        let job = Job::try_from(row).unwrap();
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.status, JobStatus::RetryScheduled);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Transient);
        assert_eq!(job.correlation_id.as_str(), "req-1");
    }
}
