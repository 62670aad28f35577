//! Worker registry: identity, capacity, liveness and crash reaping.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use ispadmin_core::{JobId, WorkerId};
use ispadmin_provisioning::{Actor, ServiceType, WorkerRegistration, WorkerState, WorkerStatus};

use super::store::{JobQueueStore, QueueError, poisoned};
use crate::clock::Clock;

/// A worker stopped heartbeating. Only used inside the reaper: it becomes a
/// log line and the recovery message in the job history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker {worker_id} missed heartbeats (last seen {last_heartbeat}, timeout {timeout:?})")]
pub struct HeartbeatTimeout {
    pub worker_id: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub timeout: Duration,
}

/// Outcome of one reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub workers_marked_offline: Vec<WorkerId>,
    pub jobs_requeued: Vec<JobId>,
    /// Another sweep was already running; nothing was done.
    pub skipped: bool,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.workers_marked_offline.is_empty() && self.jobs_requeued.is_empty()
    }
}

/// Claim slots granted to a worker ahead of a store claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Requested types intersected with the registered ones
    pub service_types: BTreeSet<ServiceType>,
}

#[derive(Debug)]
struct WorkerSlot {
    status: WorkerStatus,
    /// Claims in flight between `reserve` and `commit_claim`
    reserved: usize,
}

impl WorkerSlot {
    fn held(&self) -> usize {
        self.status.active_jobs() + self.reserved
    }
}

/// Tracks workers and recovers jobs from the ones that went silent.
pub struct WorkerRegistry<S> {
    workers: RwLock<HashMap<WorkerId, WorkerSlot>>,
    store: S,
    clock: Arc<dyn Clock>,
    reaping: Mutex<()>,
}

impl<S: JobQueueStore> WorkerRegistry<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            store,
            clock,
            reaping: Mutex::new(()),
        }
    }

    /// Create or reactivate a worker row (status `idle`).
    pub fn register(&self, registration: WorkerRegistration) -> Result<WorkerStatus, QueueError> {
        registration.validate()?;
        let now = self.clock.now();
        let mut workers = self.workers.write().map_err(poisoned)?;

        let worker_id = registration.worker_id.clone();
        let status = match workers.entry(worker_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.status.reactivate(registration, now);
                slot.reserved = 0;
                info!(worker_id = %worker_id, "worker re-registered");
                slot.status.clone()
            }
            Entry::Vacant(vacant) => {
                info!(
                    worker_id = %worker_id,
                    max_concurrent_jobs = registration.max_concurrent_jobs,
                    "worker registered"
                );
                let slot = vacant.insert(WorkerSlot {
                    status: WorkerStatus::new(registration, now),
                    reserved: 0,
                });
                slot.status.clone()
            }
        };
        Ok(status)
    }

    /// Record liveness and recompute idle/busy.
    ///
    /// An offline worker stays offline; the returned status tells the caller
    /// it must register again.
    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<WorkerStatus, QueueError> {
        let now = self.clock.now();
        let mut workers = self.workers.write().map_err(poisoned)?;
        let slot = workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::worker_not_found(worker_id))?;

        slot.status.touch(now);
        debug!(worker_id = %worker_id, status = %slot.status.status, "heartbeat");
        Ok(slot.status.clone())
    }

    pub fn get(&self, worker_id: &WorkerId) -> Result<WorkerStatus, QueueError> {
        let workers = self.workers.read().map_err(poisoned)?;
        workers
            .get(worker_id)
            .map(|slot| slot.status.clone())
            .ok_or_else(|| QueueError::worker_not_found(worker_id))
    }

    pub fn list(&self) -> Result<Vec<WorkerStatus>, QueueError> {
        let workers = self.workers.read().map_err(poisoned)?;
        let mut list: Vec<_> = workers.values().map(|slot| slot.status.clone()).collect();
        list.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(list)
    }

    /// Flag a worker as unhealthy; it gets no new work until it re-registers.
    pub fn mark_error(&self, worker_id: &WorkerId) -> Result<WorkerStatus, QueueError> {
        self.update(worker_id, |status| status.mark_error())
    }

    /// Graceful shutdown: the worker goes offline immediately.
    pub fn deregister(&self, worker_id: &WorkerId) -> Result<WorkerStatus, QueueError> {
        let status = self.update(worker_id, |status| status.mark_offline())?;
        info!(worker_id = %worker_id, "worker deregistered");
        Ok(status)
    }

    /// Reserve one claim slot for `worker_id`.
    ///
    /// Returns `None` when the worker is at capacity or none of the requested
    /// types is registered for it.
    pub fn reserve(
        &self,
        worker_id: &WorkerId,
        requested_types: &BTreeSet<ServiceType>,
        capacity: u32,
    ) -> Result<Option<Reservation>, QueueError> {
        let mut workers = self.workers.write().map_err(poisoned)?;
        let slot = workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::worker_not_found(worker_id))?;

        match slot.status.status {
            WorkerState::Offline => {
                return Err(QueueError::Conflict(format!(
                    "worker {worker_id} is offline and must register again"
                )));
            }
            WorkerState::Error => {
                return Err(QueueError::Conflict(format!(
                    "worker {worker_id} is in error state"
                )));
            }
            WorkerState::Idle | WorkerState::Busy => {}
        }

        let limit = capacity.min(slot.status.max_concurrent_jobs) as usize;
        if slot.held() >= limit {
            debug!(worker_id = %worker_id, held = slot.held(), limit, "worker at capacity");
            return Ok(None);
        }

        let service_types: BTreeSet<_> = requested_types
            .intersection(&slot.status.supported_service_types)
            .copied()
            .collect();
        if service_types.is_empty() {
            return Ok(None);
        }

        slot.reserved += 1;
        Ok(Some(Reservation { service_types }))
    }

    /// Turn a reservation into a held job.
    pub fn commit_claim(&self, worker_id: &WorkerId, job_id: JobId) -> Result<(), QueueError> {
        let mut workers = self.workers.write().map_err(poisoned)?;
        if let Some(slot) = workers.get_mut(worker_id) {
            slot.reserved = slot.reserved.saturating_sub(1);
            if slot.status.is_online() {
                slot.status.record_claim(job_id);
            }
        }
        Ok(())
    }

    /// Give back a reservation that did not produce a job.
    pub fn cancel_reservation(&self, worker_id: &WorkerId) -> Result<(), QueueError> {
        let mut workers = self.workers.write().map_err(poisoned)?;
        if let Some(slot) = workers.get_mut(worker_id) {
            slot.reserved = slot.reserved.saturating_sub(1);
        }
        Ok(())
    }

    /// Forget a held job. `succeeded` is `None` when the job was handed back
    /// unfinished, which leaves the counters alone.
    pub fn release(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        succeeded: Option<bool>,
    ) -> Result<(), QueueError> {
        let mut workers = self.workers.write().map_err(poisoned)?;
        match workers.get_mut(worker_id) {
            Some(slot) => slot.status.record_release(&job_id, succeeded),
            None => warn!(worker_id = %worker_id, job_id = %job_id, "release from unknown worker"),
        }
        Ok(())
    }

    /// Mark workers silent for longer than `timeout` offline and requeue
    /// every `processing` job they hold. `retry_count` is not touched.
    ///
    /// Also recovers orphans: processing jobs whose holder is unknown or
    /// offline, and jobs an online worker no longer tracks (it re-registered)
    /// once they have been running longer than `timeout`.
    ///
    /// Single-flight: a call made while another sweep runs returns a report
    /// with `skipped = true`.
    pub fn reap(&self, timeout: Duration) -> Result<ReapReport, QueueError> {
        let Ok(_sweep) = self.reaping.try_lock() else {
            debug!("reap already in progress; skipping");
            return Ok(ReapReport {
                skipped: true,
                ..ReapReport::default()
            });
        };

        let now = self.clock.now();
        let mut report = ReapReport::default();
        let mut lapsed: HashMap<WorkerId, HeartbeatTimeout> = HashMap::new();

        {
            let mut workers = self.workers.write().map_err(poisoned)?;
            for (worker_id, slot) in workers.iter_mut() {
                if slot.status.is_online() && slot.status.is_stale(now, timeout) {
                    let lapse = HeartbeatTimeout {
                        worker_id: worker_id.clone(),
                        last_heartbeat: slot.status.last_heartbeat,
                        timeout,
                    };
                    warn!(worker_id = %worker_id, error = %lapse, "marking worker offline");
                    slot.status.mark_offline();
                    slot.reserved = 0;
                    report.workers_marked_offline.push(worker_id.clone());
                    lapsed.insert(worker_id.clone(), lapse);
                }
            }
        }

        for job in self.store.in_flight()? {
            let Some(holder) = job.assigned_worker_id.clone() else {
                continue;
            };

            let reason = match lapsed.get(&holder) {
                Some(lapse) => lapse.to_string(),
                None => match self.orphan_reason(&holder, job.job_id, job.started_at, now, timeout)? {
                    Some(reason) => reason,
                    None => continue,
                },
            };

            if self.store.requeue_stalled(job.job_id, &holder, &reason, &Actor::Reaper)? {
                report.jobs_requeued.push(job.job_id);
            }
        }

        if !report.is_empty() {
            info!(
                workers_marked_offline = report.workers_marked_offline.len(),
                jobs_requeued = report.jobs_requeued.len(),
                "reaper sweep recovered work"
            );
        }
        Ok(report)
    }

    fn orphan_reason(
        &self,
        holder: &WorkerId,
        job_id: JobId,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let workers = self.workers.read().map_err(poisoned)?;
        let reason = match workers.get(holder) {
            None => Some(format!("worker {holder} is not registered")),
            Some(slot) if !slot.status.is_online() => Some(format!("worker {holder} is offline")),
            Some(slot) if !slot.status.active_job_ids.contains(&job_id) => {
                let running_for = started_at
                    .and_then(|at| now.signed_duration_since(at).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                (running_for > timeout)
                    .then(|| format!("worker {holder} no longer tracks this job"))
            }
            Some(_) => None,
        };
        Ok(reason)
    }

    fn update<F>(&self, worker_id: &WorkerId, f: F) -> Result<WorkerStatus, QueueError>
    where
        F: FnOnce(&mut WorkerStatus),
    {
        let mut workers = self.workers.write().map_err(poisoned)?;
        let slot = workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::worker_not_found(worker_id))?;
        f(&mut slot.status);
        slot.reserved = 0;
        Ok(slot.status.clone())
    }
}

impl<S> core::fmt::Debug for WorkerRegistry<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.read().map(|w| w.len()).unwrap_or_default())
            .finish()
    }
}
