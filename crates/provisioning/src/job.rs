//! Provisioning job record, enums and state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ispadmin_core::{CustomerId, DomainError, DomainResult, JobId, ServiceId, WorkerId};

use crate::executor::ExecutorError;
use crate::history::{Actor, Transition};
use crate::retry::RetryPolicy;

/// Kind of customer service a job provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Internet,
    Voice,
    Bundle,
}

impl ServiceType {
    pub const ALL: [ServiceType; 3] = [ServiceType::Internet, ServiceType::Voice, ServiceType::Bundle];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Internet => "internet",
            ServiceType::Voice => "voice",
            ServiceType::Bundle => "bundle",
        }
    }
}

impl FromStr for ServiceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internet" => Ok(ServiceType::Internet),
            "voice" => Ok(ServiceType::Voice),
            "bundle" => Ok(ServiceType::Bundle),
            other => Err(DomainError::validation(format!(
                "unknown service_type '{other}' (expected internet, voice or bundle)"
            ))),
        }
    }
}

impl core::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Ordering is `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Numeric rank, higher is dispatched first.
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(DomainError::validation(format!(
                "unknown priority '{other}' (expected low, normal, high or urgent)"
            ))),
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by exactly one worker
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The complete transition table. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Queued)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw enqueue payload as received from the admin/API layer.
///
/// Enum-valued fields arrive as strings and are checked by [`EnqueueRequest::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub service_id: String,
    pub service_type: String,
    pub customer_id: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_activate: bool,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

impl EnqueueRequest {
    pub fn new(
        service_id: impl Into<String>,
        service_type: impl Into<String>,
        customer_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_type: service_type.into(),
            customer_id: customer_id.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn auto_activate(mut self, auto_activate: bool) -> Self {
        self.auto_activate = auto_activate;
        self
    }

    /// Check the payload and turn it into a typed [`NewJob`].
    pub fn validate(self, default_max_retries: u32) -> DomainResult<NewJob> {
        let service_id = ServiceId::parse(self.service_id)
            .map_err(|_| DomainError::validation("service_id must not be empty"))?;
        let customer_id = CustomerId::parse(self.customer_id)
            .map_err(|_| DomainError::validation("customer_id must not be empty"))?;
        let service_type = self.service_type.parse::<ServiceType>()?;
        let priority = match self.priority {
            Some(p) => p.parse::<Priority>()?,
            None => Priority::default(),
        };

        let max_retries = match self.max_retries {
            None => default_max_retries,
            Some(n) if n < 0 => {
                return Err(DomainError::validation(format!(
                    "max_retries must be >= 0 (got {n})"
                )));
            }
            Some(n) => i32::try_from(n)
                .map(|n| n as u32)
                .map_err(|_| DomainError::validation(format!("max_retries too large ({n})")))?,
        };

        let parameters = match self.parameters {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(DomainError::validation("parameters must be a JSON object"));
            }
        };

        Ok(NewJob {
            service_id,
            service_type,
            customer_id,
            priority,
            parameters,
            scheduled_for: self.scheduled_for,
            auto_activate: self.auto_activate,
            max_retries,
        })
    }
}

/// A validated enqueue payload, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub service_id: ServiceId,
    pub service_type: ServiceType,
    pub customer_id: CustomerId,
    pub priority: Priority,
    pub parameters: Map<String, Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub auto_activate: bool,
    pub max_retries: u32,
}

/// A unit of provisioning work tied to one customer service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    /// Store-assigned row id
    pub id: u64,
    /// Externally visible correlation id
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub service_type: ServiceType,
    pub customer_id: CustomerId,
    pub priority: Priority,
    pub scheduled_for: DateTime<Utc>,
    pub auto_activate: bool,
    /// Opaque executor input
    pub parameters: Map<String, Value>,

    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub assigned_worker_id: Option<WorkerId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every transition; used for compare-and-swap by durable stores.
    pub version: u64,
}

impl ProvisioningJob {
    /// Materialise a freshly enqueued job.
    pub fn new(id: u64, job_id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id,
            service_id: new.service_id,
            service_type: new.service_type,
            customer_id: new.customer_id,
            priority: new.priority,
            scheduled_for: new.scheduled_for.unwrap_or(now),
            auto_activate: new.auto_activate,
            parameters: new.parameters,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries: new.max_retries,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            result_data: None,
            error_message: None,
            error_details: None,
            assigned_worker_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Queued and due: `scheduled_for` and any retry backoff have elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_for <= now
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Dispatch order key: higher priority first, then earliest `scheduled_for`,
    /// then earliest `created_at`, then row id.
    pub fn dispatch_key(&self) -> (core::cmp::Reverse<Priority>, DateTime<Utc>, DateTime<Utc>, u64) {
        (
            core::cmp::Reverse(self.priority),
            self.scheduled_for,
            self.created_at,
            self.id,
        )
    }

    /// queued -> processing.
    pub fn claim(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.status == JobStatus::Queued && !self.is_eligible(now) {
            return Err(DomainError::conflict(format!(
                "job {} is not yet eligible for dispatch",
                self.job_id
            )));
        }
        let from = self.move_to(JobStatus::Processing, now)?;
        self.started_at = Some(now);
        self.completed_at = None;
        self.next_retry_at = None;
        self.assigned_worker_id = Some(worker_id.clone());

        Ok(self.transition(from, format!("claimed by worker {worker_id}"), None))
    }

    /// processing -> completed.
    pub fn complete(
        &mut self,
        actor: &Actor,
        result_data: Value,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        self.ensure_held_by(actor)?;
        let from = self.move_to(JobStatus::Completed, now)?;
        self.completed_at = Some(now);
        self.result_data = Some(result_data);
        self.assigned_worker_id = None;

        Ok(self.transition(from, "provisioning completed".to_string(), None))
    }

    /// processing -> queued (retryable, budget left) or processing -> failed.
    pub fn fail(
        &mut self,
        actor: &Actor,
        error: &ExecutorError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        self.ensure_held_by(actor)?;
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Failed));
        }

        self.error_message = Some(error.message.clone());
        self.error_details = error.details.clone();

        if error.retryable && self.retry_count < self.max_retries {
            let from = self.move_to(JobStatus::Queued, now)?;
            self.retry_count += 1;
            let delay = policy.delay_for(self.retry_count, self.job_id.as_uuid().as_u128() as u64);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            self.next_retry_at = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
            self.assigned_worker_id = None;

            let message = format!(
                "retry {}/{} scheduled: {}",
                self.retry_count, self.max_retries, error.message
            );
            return Ok(self.transition(from, message, error.details.clone()));
        }

        let from = self.move_to(JobStatus::Failed, now)?;
        self.completed_at = Some(now);
        self.assigned_worker_id = None;

        let message = if error.retryable {
            format!("retries exhausted after {}: {}", self.retry_count, error.message)
        } else {
            format!("non-retryable failure: {}", error.message)
        };
        Ok(self.transition(from, message, error.details.clone()))
    }

    /// queued -> cancelled. Processing jobs cannot be cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        let from = self.move_to(JobStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        Ok(self.transition(from, "cancelled before dispatch".to_string(), None))
    }

    /// processing -> queued after the holding worker stopped heartbeating.
    ///
    /// `retry_count` is left untouched: a crash is not an application failure.
    pub fn recover(
        &mut self,
        worker_id: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Queued));
        }
        if self.assigned_worker_id.as_ref() != Some(worker_id) {
            return Err(DomainError::conflict(format!(
                "job {} is not held by worker {worker_id}",
                self.job_id
            )));
        }
        let from = self.move_to(JobStatus::Queued, now)?;
        self.assigned_worker_id = None;
        self.started_at = None;
        self.next_retry_at = None;

        Ok(self.transition(
            from,
            format!("recovered from worker {worker_id}: {reason}"),
            Some(serde_json::json!({ "forced_recovery": true, "worker_id": worker_id })),
        ))
    }

    fn ensure_held_by(&self, actor: &Actor) -> DomainResult<()> {
        if let Actor::Worker(worker_id) = actor {
            if self.status == JobStatus::Processing
                && self.assigned_worker_id.as_ref() != Some(worker_id)
            {
                return Err(DomainError::conflict(format!(
                    "job {} is not held by worker {worker_id}",
                    self.job_id
                )));
            }
        }
        Ok(())
    }

    fn move_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<JobStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.illegal(next));
        }
        let from = self.status;
        self.status = next;
        self.updated_at = now;
        self.version += 1;
        Ok(from)
    }

    fn illegal(&self, next: JobStatus) -> DomainError {
        DomainError::conflict(format!(
            "job {} cannot move from {} to {}",
            self.job_id, self.status, next
        ))
    }

    fn transition(&self, from: JobStatus, message: String, details: Option<Value>) -> Transition {
        Transition {
            job_id: self.job_id,
            from,
            to: self.status,
            message,
            details,
        }
    }
}

/// Read-side filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub service_type: Option<ServiceType>,
    pub customer_id: Option<CustomerId>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn with_customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &ProvisioningJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.service_type.is_none_or(|t| job.service_type == t)
            && self.customer_id.as_ref().is_none_or(|c| &job.customer_id == c)
            && self.priority.is_none_or(|p| job.priority == p)
    }

    /// Effective page size, clamped to `max_page_size`.
    pub fn effective_limit(&self, max_page_size: usize) -> usize {
        self.limit.unwrap_or(max_page_size).min(max_page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn worker(id: &str) -> WorkerId {
        WorkerId::parse(id).unwrap()
    }

    fn queued_job(max_retries: i64) -> ProvisioningJob {
        let new = EnqueueRequest::new("svc-1", "internet", "cust-1")
            .with_max_retries(max_retries)
            .validate(3)
            .unwrap();
        ProvisioningJob::new(1, JobId::new(), new, Utc::now())
    }

    #[test]
    fn transition_table_has_no_exit_from_terminal_states() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn validate_rejects_malformed_payloads() {
        let bad_type = EnqueueRequest::new("svc", "fax", "cust").validate(3);
        assert!(matches!(bad_type, Err(DomainError::Validation(_))));

        let bad_priority = EnqueueRequest::new("svc", "voice", "cust")
            .with_priority("asap")
            .validate(3);
        assert!(matches!(bad_priority, Err(DomainError::Validation(_))));

        let negative = EnqueueRequest::new("svc", "voice", "cust")
            .with_max_retries(-1)
            .validate(3);
        assert!(matches!(negative, Err(DomainError::Validation(_))));

        let blank = EnqueueRequest::new(" ", "voice", "cust").validate(3);
        assert!(matches!(blank, Err(DomainError::Validation(_))));

        let array_params = EnqueueRequest::new("svc", "voice", "cust")
            .with_parameters(serde_json::json!([1, 2]))
            .validate(3);
        assert!(matches!(array_params, Err(DomainError::Validation(_))));
    }

    #[test]
    fn max_retries_must_fit_a_signed_32_bit_column() {
        let too_many = EnqueueRequest::new("svc", "voice", "cust")
            .with_max_retries(i64::from(i32::MAX) + 1)
            .validate(3);
        assert!(matches!(too_many, Err(DomainError::Validation(_))));

        let largest = EnqueueRequest::new("svc", "voice", "cust")
            .with_max_retries(i64::from(i32::MAX))
            .validate(3)
            .unwrap();
        assert_eq!(largest.max_retries, i32::MAX as u32);
    }

    #[test]
    fn validate_applies_defaults() {
        let new = EnqueueRequest::new("svc", "BUNDLE", "cust").validate(4).unwrap();
        assert_eq!(new.service_type, ServiceType::Bundle);
        assert_eq!(new.priority, Priority::Normal);
        assert_eq!(new.max_retries, 4);
        assert!(new.parameters.is_empty());
    }

    #[test]
    fn scheduled_for_defaults_to_creation_time() {
        let now = Utc::now();
        let new = EnqueueRequest::new("svc", "voice", "cust").validate(3).unwrap();
        let job = ProvisioningJob::new(7, JobId::new(), new, now);
        assert_eq!(job.scheduled_for, now);
        assert!(job.is_eligible(now));
        assert!(!job.is_eligible(now - Duration::seconds(1)));
    }

    #[test]
    fn claim_then_complete_clears_assignment() {
        let mut job = queued_job(3);
        let w = worker("w1");
        let now = Utc::now();

        let t = job.claim(&w, now).unwrap();
        assert_eq!((t.from, t.to), (JobStatus::Queued, JobStatus::Processing));
        assert_eq!(job.assigned_worker_id, Some(w.clone()));

        let t = job
            .complete(&Actor::Worker(w), serde_json::json!({"ip": "10.0.0.7"}), now)
            .unwrap();
        assert_eq!((t.from, t.to), (JobStatus::Processing, JobStatus::Completed));
        assert!(job.assigned_worker_id.is_none());
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.version, 2);
    }

    #[test]
    fn only_the_holder_may_report_an_outcome() {
        let mut job = queued_job(3);
        job.claim(&worker("w1"), Utc::now()).unwrap();

        let err = job
            .complete(&Actor::Worker(worker("w2")), Value::Null, Utc::now())
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn retryable_failure_requeues_with_backoff() {
        let mut job = queued_job(2);
        let policy = RetryPolicy::default();
        let w = worker("w1");
        let now = Utc::now();

        job.claim(&w, now).unwrap();
        let t = job
            .fail(&Actor::Worker(w), &ExecutorError::retryable("radius timeout"), &policy, now)
            .unwrap();

        assert_eq!((t.from, t.to), (JobStatus::Processing, JobStatus::Queued));
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.next_retry_at, Some(now + Duration::seconds(30)));
        assert!(job.assigned_worker_id.is_none());
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + Duration::seconds(30)));
    }

    #[test]
    fn permanent_failure_ignores_remaining_budget() {
        let mut job = queued_job(5);
        let w = worker("w1");
        job.claim(&w, Utc::now()).unwrap();

        let err = ExecutorError::permanent("unknown CPE model")
            .with_details(serde_json::json!({"model": "X-1"}));
        job.fail(&Actor::Worker(w), &err, &RetryPolicy::default(), Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_message.as_deref(), Some("unknown CPE model"));
        assert_eq!(job.error_details, Some(serde_json::json!({"model": "X-1"})));
    }

    #[test]
    fn cancel_is_queued_only() {
        let mut job = queued_job(1);
        job.claim(&worker("w1"), Utc::now()).unwrap();
        assert!(job.cancel(Utc::now()).unwrap_err().is_conflict());

        let mut job = queued_job(1);
        job.cancel(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel(Utc::now()).unwrap_err().is_conflict());
    }

    #[test]
    fn recover_keeps_retry_count() {
        let mut job = queued_job(3);
        let w = worker("w1");
        let now = Utc::now();
        job.claim(&w, now).unwrap();
        job.fail(&Actor::Worker(w.clone()), &ExecutorError::retryable("x"), &RetryPolicy::default(), now)
            .unwrap();
        let later = now + Duration::hours(2);
        job.claim(&w, later).unwrap();

        let t = job.recover(&w, "heartbeat lapsed", later).unwrap();
        assert_eq!((t.from, t.to), (JobStatus::Processing, JobStatus::Queued));
        assert_eq!(job.retry_count, 1);
        assert!(job.assigned_worker_id.is_none());
        assert!(job.next_retry_at.is_none());
        assert!(job.recover(&w, "again", later).unwrap_err().is_conflict());
    }

    #[test]
    fn filter_matches_on_every_field() {
        let job = queued_job(1);
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::default().with_status(JobStatus::Queued).matches(&job));
        assert!(!JobFilter::default().with_status(JobStatus::Failed).matches(&job));
        assert!(!JobFilter::default().with_service_type(ServiceType::Voice).matches(&job));
        assert!(
            JobFilter::default()
                .with_customer(CustomerId::parse("cust-1").unwrap())
                .with_priority(Priority::Normal)
                .matches(&job)
        );
        assert_eq!(JobFilter::default().page(0, 500).effective_limit(100), 100);
    }
}
