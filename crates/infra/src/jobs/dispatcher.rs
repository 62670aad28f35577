//! Worker-facing entry point: claim, complete and fail.
//!
//! The dispatcher keeps the queue and the worker registry in step. A claim
//! first reserves a capacity slot in the registry, then asks the store for a
//! job; the reservation is either committed to the returned job or given back.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use ispadmin_core::{JobId, WorkerId};
use ispadmin_provisioning::{Actor, ExecutorError, ProvisioningJob, ServiceType, WorkerStatus};

use super::registry::WorkerRegistry;
use super::store::{JobQueueStore, QueueError};

pub struct Dispatcher<S> {
    store: S,
    registry: Arc<WorkerRegistry<S>>,
}

impl<S: JobQueueStore> Dispatcher<S> {
    pub fn new(store: S, registry: Arc<WorkerRegistry<S>>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry<S>> {
        &self.registry
    }

    /// Claim the best eligible job for `worker_id`.
    ///
    /// `capacity` is what the caller can take right now; the effective limit
    /// is `min(capacity, max_concurrent_jobs)` counted against jobs the worker
    /// already holds. Types are narrowed to the worker's registered set.
    /// Unknown workers are `NotFound`; offline or errored ones are `Conflict`.
    #[instrument(skip(self, supported_types), fields(worker_id = %worker_id))]
    pub fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
        capacity: u32,
    ) -> Result<Option<ProvisioningJob>, QueueError> {
        let Some(reservation) = self.registry.reserve(worker_id, supported_types, capacity)? else {
            return Ok(None);
        };

        match self.store.claim_next(worker_id, &reservation.service_types) {
            Ok(Some(job)) => {
                self.registry.commit_claim(worker_id, job.job_id)?;
                Ok(Some(job))
            }
            Ok(None) => {
                debug!("no eligible job");
                self.registry.cancel_reservation(worker_id)?;
                Ok(None)
            }
            Err(err) => {
                // The store error is the one worth surfacing.
                let _ = self.registry.cancel_reservation(worker_id);
                Err(err)
            }
        }
    }

    /// Report success for a job the worker holds.
    pub fn complete(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        result_data: Value,
    ) -> Result<ProvisioningJob, QueueError> {
        let job = self
            .store
            .complete(job_id, result_data, &Actor::Worker(worker_id.clone()))?;
        self.registry.release(worker_id, job_id, Some(true))?;
        Ok(job)
    }

    /// Report failure for a job the worker holds. The store decides between a
    /// scheduled retry and a terminal failure.
    pub fn fail(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        error: &ExecutorError,
    ) -> Result<ProvisioningJob, QueueError> {
        let job = self
            .store
            .fail(job_id, error, &Actor::Worker(worker_id.clone()))?;
        self.registry.release(worker_id, job_id, Some(false))?;
        Ok(job)
    }

    /// Hand back a job the worker could not finish because it is shutting
    /// down. The job is requeued without spending a retry. Returns `false`
    /// when the job was no longer held by `worker_id`.
    pub fn release_interrupted(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
    ) -> Result<bool, QueueError> {
        let requeued = self.store.requeue_stalled(
            job_id,
            worker_id,
            "worker shutdown",
            &Actor::Worker(worker_id.clone()),
        )?;
        self.registry.release(worker_id, job_id, None)?;
        Ok(requeued)
    }

    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<WorkerStatus, QueueError> {
        self.registry.heartbeat(worker_id)
    }

    /// Operator cancellation; only queued jobs can be cancelled.
    pub fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError> {
        self.store.cancel(job_id, actor)
    }
}

impl<S> core::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}
