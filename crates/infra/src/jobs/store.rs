//! Job queue storage: the system of record for provisioning jobs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use ispadmin_core::{DomainError, DomainResult, JobId, WorkerId};
use ispadmin_provisioning::{
    Actor, EnqueueRequest, ExecutorError, JobFilter, JobHistoryEntry, JobStatus, ProvisioningJob,
    RetryPolicy, ServiceType, Transition,
};

use super::history::JobHistoryLog;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;

/// Job queue store abstraction.
///
/// Every mutating method is atomic with respect to the job row it touches and
/// appends exactly one history entry per status transition.
pub trait JobQueueStore: Send + Sync {
    /// Validate and persist a new job (`queued`, `retry_count = 0`).
    fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError>;

    /// Get a job by its correlation id.
    fn get(&self, job_id: JobId) -> Result<ProvisioningJob, QueueError>;

    /// Filtered, paginated listing ordered by creation time.
    fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, QueueError>;

    /// Transition history of one job in append order.
    fn history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError>;

    /// Atomically move the best eligible job of a supported type to
    /// `processing` for `worker_id`. Two concurrent calls never return the
    /// same job.
    fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
    ) -> Result<Option<ProvisioningJob>, QueueError>;

    /// processing -> completed.
    fn complete(
        &self,
        job_id: JobId,
        result_data: Value,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError>;

    /// processing -> queued (retry with backoff) or processing -> failed.
    fn fail(
        &self,
        job_id: JobId,
        error: &ExecutorError,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError>;

    /// queued -> cancelled.
    fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError>;

    /// Forced recovery: processing -> queued for a job still held by
    /// `worker_id`, keeping `retry_count`. Used by the reaper and by a worker
    /// handing back work on shutdown. Returns `false` when the job has
    /// already moved on.
    fn requeue_stalled(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: &str,
        actor: &Actor,
    ) -> Result<bool, QueueError>;

    /// All jobs currently in `processing`.
    fn in_flight(&self) -> Result<Vec<ProvisioningJob>, QueueError>;

    /// Per-status counts.
    fn stats(&self) -> Result<JobStats, QueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::NotFound(format!("job {job_id}"))
    }

    pub fn worker_not_found(worker_id: &WorkerId) -> Self {
        Self::NotFound(format!("worker {worker_id}"))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::NotFound(msg) => Self::NotFound(msg),
            DomainError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

type JobRow = Arc<Mutex<ProvisioningJob>>;

/// In-memory job store with per-row locking.
///
/// The outer map lock is only taken for writing on insert; every transition
/// locks just the affected row. `claim_next` skips rows that are locked by a
/// concurrent caller (skip-locked) and re-checks eligibility under the row
/// lock before committing.
pub struct InMemoryJobQueueStore {
    rows: RwLock<HashMap<JobId, JobRow>>,
    next_id: AtomicU64,
    history: JobHistoryLog,
    retry: RetryPolicy,
    default_max_retries: u32,
    max_page_size: usize,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobQueueStore {
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            history: JobHistoryLog::new(),
            retry: config.retry.clone(),
            default_max_retries: config.default_max_retries,
            max_page_size: config.max_page_size,
            clock,
        }
    }

    pub fn arc(config: &QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn row(&self, job_id: JobId) -> Result<JobRow, QueueError> {
        let rows = self.rows.read().map_err(poisoned)?;
        rows.get(&job_id)
            .cloned()
            .ok_or_else(|| QueueError::job_not_found(job_id))
    }

    fn snapshot(&self) -> Result<Vec<ProvisioningJob>, QueueError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows.values() {
            jobs.push(row.lock().map_err(poisoned)?.clone());
        }
        Ok(jobs)
    }

    /// Apply a domain transition to one row: mutate a working copy, append
    /// the history entry, then publish the copy. Either both land or neither.
    fn apply<F>(&self, job_id: JobId, actor: &Actor, f: F) -> Result<ProvisioningJob, QueueError>
    where
        F: FnOnce(&mut ProvisioningJob, DateTime<Utc>) -> DomainResult<Transition>,
    {
        let row = self.row(job_id)?;
        let mut job = row.lock().map_err(poisoned)?;
        let now = self.clock.now();

        let mut next = job.clone();
        let transition = f(&mut next, now)?;
        self.history.append(transition, actor, now)?;
        *job = next;
        Ok(job.clone())
    }
}

impl core::fmt::Debug for InMemoryJobQueueStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryJobQueueStore")
            .field("jobs", &self.rows.read().map(|r| r.len()).unwrap_or_default())
            .field("retry", &self.retry)
            .finish()
    }
}

impl JobQueueStore for InMemoryJobQueueStore {
    fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let new = request.validate(self.default_max_retries)?;
        let now = self.clock.now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = ProvisioningJob::new(id, JobId::new(), new, now);
        let job_id = job.job_id;

        let mut rows = self.rows.write().map_err(poisoned)?;
        if rows.contains_key(&job_id) {
            return Err(QueueError::Conflict(format!("job {job_id} already exists")));
        }
        info!(
            job_id = %job_id,
            service_id = %job.service_id,
            service_type = %job.service_type,
            priority = %job.priority,
            scheduled_for = %job.scheduled_for,
            "provisioning job enqueued"
        );
        rows.insert(job_id, Arc::new(Mutex::new(job)));
        Ok(job_id)
    }

    fn get(&self, job_id: JobId) -> Result<ProvisioningJob, QueueError> {
        let row = self.row(job_id)?;
        let job = row.lock().map_err(poisoned)?;
        Ok(job.clone())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, QueueError> {
        let mut jobs: Vec<_> = self
            .snapshot()?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();

        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit(self.max_page_size))
            .collect())
    }

    fn history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError> {
        // Unknown ids are an error, not an empty history.
        self.row(job_id)?;
        self.history.for_job(job_id)
    }

    fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
    ) -> Result<Option<ProvisioningJob>, QueueError> {
        let now = self.clock.now();
        let rows = self.rows.read().map_err(poisoned)?;

        let mut candidates = Vec::new();
        for row in rows.values() {
            let job = match row.try_lock() {
                Ok(job) => job,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(e)) => return Err(poisoned(e)),
            };
            if job.is_eligible(now) && supported_types.contains(&job.service_type) {
                candidates.push((job.dispatch_key(), Arc::clone(row)));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let actor = Actor::Worker(worker_id.clone());
        for (_, row) in candidates {
            let mut job = match row.try_lock() {
                Ok(job) => job,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(e)) => return Err(poisoned(e)),
            };
            // Lost the race between snapshot and lock.
            if !job.is_eligible(now) {
                continue;
            }

            let mut next = job.clone();
            let transition = next.claim(worker_id, now)?;
            self.history.append(transition, &actor, now)?;
            *job = next;

            debug!(
                job_id = %job.job_id,
                worker_id = %worker_id,
                priority = %job.priority,
                retry_count = job.retry_count,
                "job claimed"
            );
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    fn complete(
        &self,
        job_id: JobId,
        result_data: Value,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        let job = self.apply(job_id, actor, |job, now| job.complete(actor, result_data, now))?;
        info!(job_id = %job_id, by = %actor.created_by(), "job completed");
        Ok(job)
    }

    fn fail(
        &self,
        job_id: JobId,
        error: &ExecutorError,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        let retry = &self.retry;
        let job = self.apply(job_id, actor, |job, now| job.fail(actor, error, retry, now))?;

        match job.status {
            JobStatus::Queued => info!(
                job_id = %job_id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                next_retry_at = ?job.next_retry_at,
                error = %error,
                "job requeued for retry"
            ),
            _ => warn!(
                job_id = %job_id,
                retry_count = job.retry_count,
                retryable = error.retryable,
                error = %error,
                "job failed"
            ),
        }
        Ok(job)
    }

    fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError> {
        let job = self.apply(job_id, actor, |job, now| job.cancel(now))?;
        info!(job_id = %job_id, by = %actor.created_by(), "job cancelled");
        Ok(job)
    }

    fn requeue_stalled(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: &str,
        actor: &Actor,
    ) -> Result<bool, QueueError> {
        let row = self.row(job_id)?;
        let mut job = row.lock().map_err(poisoned)?;
        if job.status != JobStatus::Processing || job.assigned_worker_id.as_ref() != Some(worker_id)
        {
            return Ok(false);
        }

        let now = self.clock.now();
        let mut next = job.clone();
        let transition = next.recover(worker_id, reason, now)?;
        self.history.append(transition, actor, now)?;
        *job = next;

        warn!(
            job_id = %job_id,
            worker_id = %worker_id,
            retry_count = job.retry_count,
            by = %actor.created_by(),
            reason,
            "stalled job requeued"
        );
        Ok(true)
    }

    fn in_flight(&self) -> Result<Vec<ProvisioningJob>, QueueError> {
        let mut jobs: Vec<_> = self
            .snapshot()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Processing)
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    fn stats(&self) -> Result<JobStats, QueueError> {
        let mut stats = JobStats::default();
        for job in self.snapshot()? {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

impl<S> JobQueueStore for Arc<S>
where
    S: JobQueueStore + ?Sized,
{
    fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        (**self).enqueue(request)
    }

    fn get(&self, job_id: JobId) -> Result<ProvisioningJob, QueueError> {
        (**self).get(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, QueueError> {
        (**self).list(filter)
    }

    fn history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError> {
        (**self).history(job_id)
    }

    fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
    ) -> Result<Option<ProvisioningJob>, QueueError> {
        (**self).claim_next(worker_id, supported_types)
    }

    fn complete(
        &self,
        job_id: JobId,
        result_data: Value,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        (**self).complete(job_id, result_data, actor)
    }

    fn fail(
        &self,
        job_id: JobId,
        error: &ExecutorError,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        (**self).fail(job_id, error, actor)
    }

    fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError> {
        (**self).cancel(job_id, actor)
    }

    fn requeue_stalled(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: &str,
        actor: &Actor,
    ) -> Result<bool, QueueError> {
        (**self).requeue_stalled(job_id, worker_id, reason, actor)
    }

    fn in_flight(&self) -> Result<Vec<ProvisioningJob>, QueueError> {
        (**self).in_flight()
    }

    fn stats(&self) -> Result<JobStats, QueueError> {
        (**self).stats()
    }
}
