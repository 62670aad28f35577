//! Postgres-backed job queue.
//!
//! Same semantics as [`InMemoryJobQueueStore`](super::store::InMemoryJobQueueStore),
//! with the database providing the atomicity:
//!
//! - every transition runs in one transaction that locks the job row
//!   (`SELECT ... FOR UPDATE`), applies the domain transition, writes the row
//!   back and inserts the history entry
//! - `claim_next` picks its candidate with `FOR UPDATE SKIP LOCKED`, so
//!   concurrent claimers never block on, or return, the same row
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, info, instrument, warn};

use ispadmin_core::{CustomerId, DomainResult, JobId, ServiceId, WorkerId};
use ispadmin_provisioning::{
    Actor, EnqueueRequest, ExecutorError, JobFilter, JobHistoryEntry, JobStatus, Priority,
    ProvisioningJob, RetryPolicy, ServiceType, Transition,
};

use super::store::{JobStats, QueueError};
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;

/// Tables and indexes used by [`PostgresJobQueueStore`]. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS provisioning_jobs (
    id                  BIGSERIAL PRIMARY KEY,
    job_id              UUID NOT NULL UNIQUE,
    service_id          TEXT NOT NULL,
    service_type        TEXT NOT NULL CHECK (service_type IN ('internet', 'voice', 'bundle')),
    customer_id         TEXT NOT NULL,
    priority            TEXT NOT NULL CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
    priority_rank       SMALLINT NOT NULL,
    scheduled_for       TIMESTAMPTZ NOT NULL,
    auto_activate       BOOLEAN NOT NULL DEFAULT FALSE,
    parameters          JSONB NOT NULL DEFAULT '{}'::jsonb,
    status              TEXT NOT NULL
                        CHECK (status IN ('queued', 'processing', 'completed', 'failed', 'cancelled')),
    retry_count         INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    max_retries         INTEGER NOT NULL CHECK (max_retries >= 0),
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    next_retry_at       TIMESTAMPTZ,
    result_data         JSONB,
    error_message       TEXT,
    error_details       JSONB,
    assigned_worker_id  TEXT,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    version             BIGINT NOT NULL DEFAULT 0,
    CHECK (retry_count <= max_retries),
    CHECK ((status = 'processing') = (assigned_worker_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS provisioning_jobs_dispatch_idx
    ON provisioning_jobs (priority_rank DESC, scheduled_for, created_at)
    WHERE status = 'queued';

CREATE INDEX IF NOT EXISTS provisioning_jobs_in_flight_idx
    ON provisioning_jobs (assigned_worker_id)
    WHERE status = 'processing';

CREATE INDEX IF NOT EXISTS provisioning_jobs_customer_idx
    ON provisioning_jobs (customer_id, created_at);

CREATE TABLE IF NOT EXISTS provisioning_job_history (
    id          BIGSERIAL PRIMARY KEY,
    job_id      UUID NOT NULL REFERENCES provisioning_jobs (job_id),
    old_status  TEXT NOT NULL,
    new_status  TEXT NOT NULL,
    message     TEXT NOT NULL,
    details     JSONB,
    created_at  TIMESTAMPTZ NOT NULL,
    created_by  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS provisioning_job_history_job_idx
    ON provisioning_job_history (job_id, id);
"#;

const JOB_COLUMNS: &str = r#"
    id, job_id, service_id, service_type, customer_id, priority, scheduled_for,
    auto_activate, parameters, status, retry_count, max_retries, started_at,
    completed_at, next_retry_at, result_data, error_message, error_details,
    assigned_worker_id, created_at, updated_at, version
"#;

/// Durable job queue on PostgreSQL.
///
/// Methods are `async` and mirror [`JobQueueStore`](super::store::JobQueueStore)
/// one to one; [`BlockingPostgresStore`](super::blocking::BlockingPostgresStore)
/// wraps them for the synchronous components. Time comes from the injected [`Clock`] so eligibility and
/// backoff are computed identically to the in-memory store.
#[derive(Clone)]
pub struct PostgresJobQueueStore {
    pool: Arc<PgPool>,
    retry: RetryPolicy,
    default_max_retries: u32,
    max_page_size: usize,
    clock: Arc<dyn Clock>,
}

impl PostgresJobQueueStore {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, config: &QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            retry: config.retry.clone(),
            default_max_retries: config.default_max_retries,
            max_page_size: config.max_page_size,
            clock,
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(job_id), err)]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let new = request.validate(self.default_max_retries)?;
        let now = self.clock.now();
        let job = ProvisioningJob::new(0, JobId::new(), new, now);
        Span::current().record("job_id", tracing::field::display(job.job_id));

        sqlx::query(
            r#"
            INSERT INTO provisioning_jobs (
                job_id, service_id, service_type, customer_id, priority, priority_rank,
                scheduled_for, auto_activate, parameters, status, retry_count, max_retries,
                created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $12, 0)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.service_id.as_str())
        .bind(job.service_type.as_str())
        .bind(job.customer_id.as_str())
        .bind(job.priority.as_str())
        .bind(job.priority.rank())
        .bind(job.scheduled_for)
        .bind(job.auto_activate)
        .bind(Value::Object(job.parameters.clone()))
        .bind(JobStatus::Queued.as_str())
        .bind(job.max_retries as i32)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        info!(
            job_id = %job.job_id,
            service_type = %job.service_type,
            priority = %job.priority,
            "provisioning job enqueued"
        );
        Ok(job.job_id)
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, job_id: JobId) -> Result<ProvisioningJob, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or_else(|| QueueError::job_not_found(job_id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, QueueError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM provisioning_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR service_type = $2)
              AND ($3::text IS NULL OR customer_id = $3)
              AND ($4::text IS NULL OR priority = $4)
            ORDER BY created_at ASC, id ASC
            OFFSET $5 LIMIT $6
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.service_type.map(|t| t.as_str()))
            .bind(filter.customer_id.as_ref().map(|c| c.as_str()))
            .bind(filter.priority.map(|p| p.as_str()))
            .bind(filter.offset as i64)
            .bind(filter.effective_limit(self.max_page_size) as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError> {
        // Unknown ids are an error, not an empty history.
        self.get(job_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, job_id, old_status, new_status, message, details, created_at, created_by
            FROM provisioning_job_history
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        rows.iter().map(history_from_row).collect()
    }

    /// Claim the best eligible job. The candidate is picked and locked in one
    /// statement; rows locked by other claimers are skipped, not waited on.
    #[instrument(skip(self, supported_types), fields(worker_id = %worker_id), err)]
    pub async fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
    ) -> Result<Option<ProvisioningJob>, QueueError> {
        if supported_types.is_empty() {
            return Ok(None);
        }
        let types: Vec<String> = supported_types.iter().map(|t| t.as_str().to_string()).collect();
        let now = self.clock.now();

        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM provisioning_jobs
            WHERE status = 'queued'
              AND scheduled_for <= $1
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND service_type = ANY($2)
            ORDER BY priority_rank DESC, scheduled_for ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let Some(row) = sqlx::query(&sql)
            .bind(now)
            .bind(&types)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?
        else {
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        let transition = job.claim(worker_id, now)?;
        write_job(&mut tx, &job).await?;
        insert_history(&mut tx, transition, &Actor::Worker(worker_id.clone()), now).await?;
        commit(tx).await?;

        debug!(job_id = %job.job_id, priority = %job.priority, "job claimed");
        Ok(Some(job))
    }

    pub async fn complete(
        &self,
        job_id: JobId,
        result_data: Value,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        let job = self
            .apply("complete", job_id, actor, |job, now| {
                job.complete(actor, result_data, now)
            })
            .await?;
        info!(job_id = %job_id, by = %actor.created_by(), "job completed");
        Ok(job)
    }

    pub async fn fail(
        &self,
        job_id: JobId,
        error: &ExecutorError,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        let retry = &self.retry;
        let job = self
            .apply("fail", job_id, actor, |job, now| job.fail(actor, error, retry, now))
            .await?;
        if job.status == JobStatus::Failed {
            warn!(job_id = %job_id, retry_count = job.retry_count, error = %error, "job failed");
        } else {
            info!(job_id = %job_id, next_retry_at = ?job.next_retry_at, "job requeued for retry");
        }
        Ok(job)
    }

    pub async fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError> {
        self.apply("cancel", job_id, actor, |job, now| job.cancel(now))
            .await
    }

    /// Reaper recovery for a job still held by `worker_id`.
    pub async fn requeue_stalled(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: &str,
        actor: &Actor,
    ) -> Result<bool, QueueError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        if job.status != JobStatus::Processing || job.assigned_worker_id.as_ref() != Some(worker_id)
        {
            return Ok(false);
        }

        let now = self.clock.now();
        let transition = job.recover(worker_id, reason, now)?;
        write_job(&mut tx, &job).await?;
        insert_history(&mut tx, transition, actor, now).await?;
        commit(tx).await?;

        warn!(job_id = %job_id, worker_id = %worker_id, by = %actor.created_by(), reason, "stalled job requeued");
        Ok(true)
    }

    pub async fn in_flight(&self) -> Result<Vec<ProvisioningJob>, QueueError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE status = 'processing' ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("in_flight", e))?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM provisioning_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n as usize;
            match status.parse::<JobStatus>()? {
                JobStatus::Queued => stats.queued = n,
                JobStatus::Processing => stats.processing = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
                JobStatus::Cancelled => stats.cancelled = n,
            }
        }
        Ok(stats)
    }

    /// Lock the row, apply a domain transition, write row and history, commit.
    /// A rejected transition drops the transaction, which rolls it back.
    #[instrument(skip(self, actor, f), fields(job_id = %job_id), err)]
    async fn apply<F>(
        &self,
        operation: &'static str,
        job_id: JobId,
        actor: &Actor,
        f: F,
    ) -> Result<ProvisioningJob, QueueError>
    where
        F: FnOnce(&mut ProvisioningJob, DateTime<Utc>) -> DomainResult<Transition>,
    {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let now = self.clock.now();
        let transition = f(&mut job, now)?;
        write_job(&mut tx, &job).await?;
        insert_history(&mut tx, transition, actor, now).await?;
        commit(tx).await?;
        Ok(job)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

impl core::fmt::Debug for PostgresJobQueueStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresJobQueueStore")
            .field("retry", &self.retry)
            .field("default_max_retries", &self.default_max_retries)
            .finish()
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<ProvisioningJob, QueueError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE job_id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or_else(|| QueueError::job_not_found(job_id))?;
    job_from_row(&row)
}

/// Write back the mutable part of a job row.
async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &ProvisioningJob,
) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        UPDATE provisioning_jobs SET
            status = $2,
            retry_count = $3,
            started_at = $4,
            completed_at = $5,
            next_retry_at = $6,
            result_data = $7,
            error_message = $8,
            error_details = $9,
            assigned_worker_id = $10,
            updated_at = $11,
            version = $12
        WHERE job_id = $1
        "#,
    )
    .bind(job.job_id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.retry_count as i32)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.next_retry_at)
    .bind(&job.result_data)
    .bind(&job.error_message)
    .bind(&job.error_details)
    .bind(job.assigned_worker_id.as_ref().map(|w| w.as_str()))
    .bind(job.updated_at)
    .bind(job.version as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    transition: Transition,
    actor: &Actor,
    at: DateTime<Utc>,
) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        INSERT INTO provisioning_job_history (
            job_id, old_status, new_status, message, details, created_at, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(transition.job_id.as_uuid())
    .bind(transition.from.as_str())
    .bind(transition.to.as_str())
    .bind(&transition.message)
    .bind(&transition.details)
    .bind(at)
    .bind(actor.created_by())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), QueueError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ProvisioningJob, QueueError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let id: i64 = row.try_get("id").map_err(get)?;
    let job_id: uuid::Uuid = row.try_get("job_id").map_err(get)?;
    let service_id: String = row.try_get("service_id").map_err(get)?;
    let service_type: String = row.try_get("service_type").map_err(get)?;
    let customer_id: String = row.try_get("customer_id").map_err(get)?;
    let priority: String = row.try_get("priority").map_err(get)?;
    let parameters: Value = row.try_get("parameters").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(get)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(get)?;
    let assigned_worker_id: Option<String> = row.try_get("assigned_worker_id").map_err(get)?;
    let version: i64 = row.try_get("version").map_err(get)?;

    let parameters = match parameters {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(QueueError::Storage(format!(
                "job {job_id}: parameters is not an object: {other}"
            )));
        }
    };

    Ok(ProvisioningJob {
        id: id as u64,
        job_id: JobId::from_uuid(job_id),
        service_id: ServiceId::parse(service_id)?,
        service_type: service_type.parse::<ServiceType>()?,
        customer_id: CustomerId::parse(customer_id)?,
        priority: priority.parse::<Priority>()?,
        scheduled_for: row.try_get("scheduled_for").map_err(get)?,
        auto_activate: row.try_get("auto_activate").map_err(get)?,
        parameters,
        status: status.parse::<JobStatus>()?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        started_at: row.try_get("started_at").map_err(get)?,
        completed_at: row.try_get("completed_at").map_err(get)?,
        next_retry_at: row.try_get("next_retry_at").map_err(get)?,
        result_data: row.try_get("result_data").map_err(get)?,
        error_message: row.try_get("error_message").map_err(get)?,
        error_details: row.try_get("error_details").map_err(get)?,
        assigned_worker_id: assigned_worker_id.map(WorkerId::parse).transpose()?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
        version: version as u64,
    })
}

fn history_from_row(row: &sqlx::postgres::PgRow) -> Result<JobHistoryEntry, QueueError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_history", e);

    let id: i64 = row.try_get("id").map_err(get)?;
    let job_id: uuid::Uuid = row.try_get("job_id").map_err(get)?;
    let old_status: String = row.try_get("old_status").map_err(get)?;
    let new_status: String = row.try_get("new_status").map_err(get)?;

    Ok(JobHistoryEntry {
        id: id as u64,
        job_id: JobId::from_uuid(job_id),
        old_status: old_status.parse()?,
        new_status: new_status.parse()?,
        message: row.try_get("message").map_err(get)?,
        details: row.try_get("details").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        created_by: row.try_get("created_by").map_err(get)?,
    })
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => QueueError::Conflict(msg),
                Some("23514") => QueueError::Validation(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
