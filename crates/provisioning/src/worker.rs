//! Worker liveness records.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ispadmin_core::{DomainError, DomainResult, JobId, WorkerId};

use crate::job::ServiceType;

/// Coarse worker state as shown on dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Offline => "offline",
            WorkerState::Error => "error",
        }
    }
}

impl core::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker announces when it (re)registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub supported_service_types: BTreeSet<ServiceType>,
    pub max_concurrent_jobs: u32,
}

impl WorkerRegistration {
    pub fn new(
        worker_id: WorkerId,
        worker_name: impl Into<String>,
        supported_service_types: impl IntoIterator<Item = ServiceType>,
        max_concurrent_jobs: u32,
    ) -> Self {
        Self {
            worker_id,
            worker_name: worker_name.into(),
            supported_service_types: supported_service_types.into_iter().collect(),
            max_concurrent_jobs,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(DomainError::validation("max_concurrent_jobs must be >= 1"));
        }
        if self.supported_service_types.is_empty() {
            return Err(DomainError::validation(
                "a worker must support at least one service type",
            ));
        }
        Ok(())
    }
}

/// One row per known worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub status: WorkerState,
    /// Most recently claimed job still held
    pub current_job_id: Option<JobId>,
    /// Every job the worker currently holds
    pub active_job_ids: BTreeSet<JobId>,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub max_concurrent_jobs: u32,
    pub supported_service_types: BTreeSet<ServiceType>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: registration.worker_id,
            worker_name: registration.worker_name,
            status: WorkerState::Idle,
            current_job_id: None,
            active_job_ids: BTreeSet::new(),
            jobs_processed: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            last_heartbeat: now,
            max_concurrent_jobs: registration.max_concurrent_jobs,
            supported_service_types: registration.supported_service_types,
            registered_at: now,
        }
    }

    /// Re-register: new capabilities, fresh liveness, counters kept.
    ///
    /// Claims from a previous incarnation are forgotten; the reaper requeues them.
    pub fn reactivate(&mut self, registration: WorkerRegistration, now: DateTime<Utc>) {
        self.worker_name = registration.worker_name;
        self.supported_service_types = registration.supported_service_types;
        self.max_concurrent_jobs = registration.max_concurrent_jobs;
        self.active_job_ids.clear();
        self.current_job_id = None;
        self.last_heartbeat = now;
        self.registered_at = now;
        self.status = WorkerState::Idle;
    }

    pub fn active_jobs(&self) -> usize {
        self.active_job_ids.len()
    }

    pub fn is_online(&self) -> bool {
        self.status != WorkerState::Offline
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.recompute_status();
    }

    pub fn record_claim(&mut self, job_id: JobId) {
        self.active_job_ids.insert(job_id);
        self.current_job_id = Some(job_id);
        self.recompute_status();
    }

    /// Forget a held job. `succeeded` is `None` when the release is not an
    /// outcome report (e.g. the claim was rolled back).
    pub fn record_release(&mut self, job_id: &JobId, succeeded: Option<bool>) {
        self.active_job_ids.remove(job_id);
        if self.current_job_id.as_ref() == Some(job_id) {
            self.current_job_id = self.active_job_ids.iter().next_back().copied();
        }
        match succeeded {
            Some(true) => {
                self.jobs_processed += 1;
                self.jobs_succeeded += 1;
            }
            Some(false) => {
                self.jobs_processed += 1;
                self.jobs_failed += 1;
            }
            None => {}
        }
        self.recompute_status();
    }

    pub fn mark_offline(&mut self) {
        self.status = WorkerState::Offline;
        self.active_job_ids.clear();
        self.current_job_id = None;
    }

    pub fn mark_error(&mut self) {
        if self.is_online() {
            self.status = WorkerState::Error;
        }
    }

    /// Idle/busy from the held-job count. Offline and error are sticky until
    /// the worker re-registers.
    pub fn recompute_status(&mut self) {
        if matches!(self.status, WorkerState::Offline | WorkerState::Error) {
            return;
        }
        self.status = if self.active_job_ids.is_empty() {
            WorkerState::Idle
        } else {
            WorkerState::Busy
        };
    }
}
