//! Synchronous [`JobQueueStore`] over [`PostgresJobQueueStore`].
//!
//! The registry, dispatcher, reaper and worker runtime are synchronous and
//! run on plain threads as well as inside axum handlers. This adapter drives
//! the async store on a tokio runtime handle so those components can run
//! against Postgres unchanged.

use std::collections::BTreeSet;
use std::future::Future;

use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};

use ispadmin_core::{JobId, WorkerId};
use ispadmin_provisioning::{
    Actor, EnqueueRequest, ExecutorError, JobFilter, JobHistoryEntry, ProvisioningJob, ServiceType,
};

use super::postgres::PostgresJobQueueStore;
use super::store::{JobQueueStore, JobStats, QueueError};

/// Blocking handle to a Postgres queue.
///
/// Callable from std threads and from tasks on a multi-thread runtime. Calls
/// made from inside a current-thread runtime would deadlock that runtime and
/// are refused with `QueueError::Storage` instead.
#[derive(Clone)]
pub struct BlockingPostgresStore {
    inner: PostgresJobQueueStore,
    runtime: Handle,
}

impl BlockingPostgresStore {
    pub fn new(inner: PostgresJobQueueStore, runtime: Handle) -> Self {
        Self { inner, runtime }
    }

    pub fn inner(&self) -> &PostgresJobQueueStore {
        &self.inner
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, QueueError>>,
    {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(QueueError::Storage(
                    "blocking postgres store called from a current-thread runtime".to_string(),
                ))
            }
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}

impl core::fmt::Debug for BlockingPostgresStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingPostgresStore")
            .field("inner", &self.inner)
            .finish()
    }
}

impl JobQueueStore for BlockingPostgresStore {
    fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        self.block_on(self.inner.enqueue(request))
    }

    fn get(&self, job_id: JobId) -> Result<ProvisioningJob, QueueError> {
        self.block_on(self.inner.get(job_id))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, QueueError> {
        self.block_on(self.inner.list(filter))
    }

    fn history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError> {
        self.block_on(self.inner.history(job_id))
    }

    fn claim_next(
        &self,
        worker_id: &WorkerId,
        supported_types: &BTreeSet<ServiceType>,
    ) -> Result<Option<ProvisioningJob>, QueueError> {
        self.block_on(self.inner.claim_next(worker_id, supported_types))
    }

    fn complete(
        &self,
        job_id: JobId,
        result_data: Value,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        self.block_on(self.inner.complete(job_id, result_data, actor))
    }

    fn fail(
        &self,
        job_id: JobId,
        error: &ExecutorError,
        actor: &Actor,
    ) -> Result<ProvisioningJob, QueueError> {
        self.block_on(self.inner.fail(job_id, error, actor))
    }

    fn cancel(&self, job_id: JobId, actor: &Actor) -> Result<ProvisioningJob, QueueError> {
        self.block_on(self.inner.cancel(job_id, actor))
    }

    fn requeue_stalled(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: &str,
        actor: &Actor,
    ) -> Result<bool, QueueError> {
        self.block_on(self.inner.requeue_stalled(job_id, worker_id, reason, actor))
    }

    fn in_flight(&self) -> Result<Vec<ProvisioningJob>, QueueError> {
        self.block_on(self.inner.in_flight())
    }

    fn stats(&self) -> Result<JobStats, QueueError> {
        self.block_on(self.inner.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use sqlx::postgres::PgPoolOptions;

    use crate::clock::SystemClock;
    use crate::config::QueueConfig;
    use crate::jobs::{Dispatcher, WorkerRegistry};

    // Nothing listens on port 1, so every acquire fails fast.
    const UNREACHABLE: &str = "postgres://ispadmin@127.0.0.1:1/ispadmin";

    fn unreachable_store(runtime: &tokio::runtime::Runtime) -> BlockingPostgresStore {
        let _guard = runtime.enter();
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy(UNREACHABLE)
            .unwrap();
        let inner = PostgresJobQueueStore::new(pool, &QueueConfig::default());
        BlockingPostgresStore::new(inner, runtime.handle().clone())
    }

    #[test]
    fn database_errors_surface_as_storage_errors_on_plain_threads() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let store = unreachable_store(&runtime);

        let handle = std::thread::spawn(move || {
            (store.stats(), store.get(JobId::new()))
        });
        let (stats, get) = handle.join().unwrap();
        assert!(matches!(stats, Err(QueueError::Storage(_))));
        assert!(matches!(get, Err(QueueError::Storage(_))));
    }

    #[test]
    fn dispatcher_runs_over_the_adapter() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let store = Arc::new(unreachable_store(&runtime));
        let registry = Arc::new(WorkerRegistry::new(store.clone(), Arc::new(SystemClock)));
        let dispatcher = Dispatcher::new(store, registry.clone());

        let worker = WorkerId::parse("pg-edge").unwrap();
        registry
            .register(ispadmin_provisioning::WorkerRegistration::new(
                worker.clone(),
                "pg-edge",
                ServiceType::ALL,
                1,
            ))
            .unwrap();

        let types: BTreeSet<ServiceType> = ServiceType::ALL.into_iter().collect();
        let err = dispatcher.claim_next(&worker, &types, 1).unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(registry.get(&worker).unwrap().active_job_ids.is_empty());

        // The single slot was handed back, so the next claim reaches the store again.
        let err = dispatcher.claim_next(&worker, &types, 1).unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn usable_from_multi_thread_runtime_tasks() {
        let runtime = tokio::runtime::Handle::current();
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy(UNREACHABLE)
            .unwrap();
        let store = BlockingPostgresStore::new(
            PostgresJobQueueStore::new(pool, &QueueConfig::default()),
            runtime,
        );
        assert!(matches!(store.stats(), Err(QueueError::Storage(_))));
    }

    #[tokio::test]
    async fn current_thread_runtimes_are_refused() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy(UNREACHABLE)
            .unwrap();
        let store = BlockingPostgresStore::new(
            PostgresJobQueueStore::new(pool, &QueueConfig::default()),
            tokio::runtime::Handle::current(),
        );
        let err = store.stats().unwrap_err();
        assert!(matches!(err, QueueError::Storage(msg) if msg.contains("current-thread")));
    }
}
