//! Worker runtime: registers a worker, keeps it heartbeating and runs claimed
//! jobs through the executor for their service type.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use ispadmin_core::WorkerId;
use ispadmin_provisioning::{
    CancellationToken, ExecutorError, ExecutorRegistry, ProvisioningJob, ServiceType,
    WorkerRegistration, WorkerState, WorkerStatus,
};

use crate::jobs::{Dispatcher, JobQueueStore, QueueError};

/// Runtime settings of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub worker_name: String,
    /// Empty means every type that has an executor
    pub supported_types: BTreeSet<ServiceType>,
    /// Number of execution threads and the claim capacity
    pub max_concurrent_jobs: u32,
    /// Sleep between claim attempts when the queue is empty
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_name: worker_id.to_string(),
            worker_id,
            supported_types: BTreeSet::new(),
            max_concurrent_jobs: 1,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_service_types(mut self, types: impl IntoIterator<Item = ServiceType>) -> Self {
        self.supported_types = types.into_iter().collect();
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerSpawnError {
    #[error("worker {0} has no executor for any of its service types")]
    NoExecutors(WorkerId),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Shutdown flag that sleeping threads can wait on.
#[derive(Debug, Default)]
struct ShutdownSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    fn trigger(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
        }
        self.wake.notify_all();
    }

    fn is_triggered(&self) -> bool {
        self.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Sleep up to `timeout`. Returns `true` once shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.stopped.lock() else {
            return true;
        };
        match self.wake.wait_timeout_while(guard, timeout, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

struct WorkerContext<S> {
    dispatcher: Arc<Dispatcher<S>>,
    executors: ExecutorRegistry,
    registration: WorkerRegistration,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    signal: ShutdownSignal,
    cancel: CancellationToken,
}

impl<S> WorkerContext<S> {
    fn worker_id(&self) -> &WorkerId {
        &self.registration.worker_id
    }
}

/// Handle to a running worker.
pub struct WorkerHandle<S: JobQueueStore> {
    context: Arc<WorkerContext<S>>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl<S: JobQueueStore> WorkerHandle<S> {
    pub fn worker_id(&self) -> &WorkerId {
        self.context.worker_id()
    }

    /// Stop claiming, signal running executors to stop, wait for every
    /// thread and deregister (the worker goes offline at once).
    pub fn shutdown(mut self) -> Result<WorkerStatus, QueueError> {
        self.stop_threads();
        self.context.dispatcher.registry().deregister(self.context.worker_id())
    }

    fn stop_threads(&mut self) {
        self.context.signal.trigger();
        self.context.cancel.cancel();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl<S: JobQueueStore> core::fmt::Debug for WorkerHandle<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", self.context.worker_id())
            .field("threads", &self.joins.len())
            .finish()
    }
}

/// Worker daemon: registers, heartbeats, and runs claimed jobs through the
/// executor registered for their service type.
///
/// - one heartbeat thread
/// - `max_concurrent_jobs` execution threads sharing one claim capacity
/// - executor panics are reported as permanent failures
#[derive(Debug)]
pub struct ProvisioningWorker;

impl ProvisioningWorker {
    pub fn spawn<S>(
        dispatcher: Arc<Dispatcher<S>>,
        executors: ExecutorRegistry,
        config: WorkerConfig,
    ) -> Result<WorkerHandle<S>, WorkerSpawnError>
    where
        S: JobQueueStore + 'static,
    {
        let available = executors.supported_types();
        let service_types: BTreeSet<_> = if config.supported_types.is_empty() {
            available
        } else {
            config.supported_types.intersection(&available).copied().collect()
        };
        if service_types.is_empty() {
            return Err(WorkerSpawnError::NoExecutors(config.worker_id));
        }

        let registration = WorkerRegistration::new(
            config.worker_id.clone(),
            config.worker_name.clone(),
            service_types,
            config.max_concurrent_jobs,
        );
        dispatcher.registry().register(registration.clone())?;

        let context = Arc::new(WorkerContext {
            dispatcher,
            executors,
            registration,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            signal: ShutdownSignal::default(),
            cancel: CancellationToken::new(),
        });
        let mut handle = WorkerHandle {
            context: context.clone(),
            joins: Vec::with_capacity(config.max_concurrent_jobs as usize + 1),
        };

        let ctx = context.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-heartbeat", config.worker_id))
            .spawn(move || heartbeat_loop(&ctx));
        if let Err(e) = spawned.map(|join| handle.joins.push(join)) {
            let _ = handle.shutdown();
            return Err(e.into());
        }

        for slot in 0..config.max_concurrent_jobs {
            let ctx = context.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-exec-{slot}", config.worker_id))
                .spawn(move || execution_loop(&ctx));
            if let Err(e) = spawned.map(|join| handle.joins.push(join)) {
                let _ = handle.shutdown();
                return Err(e.into());
            }
        }

        info!(
            worker_id = %config.worker_id,
            service_types = ?context.registration.supported_service_types,
            max_concurrent_jobs = config.max_concurrent_jobs,
            "provisioning worker started"
        );
        Ok(handle)
    }
}

fn heartbeat_loop<S: JobQueueStore>(ctx: &WorkerContext<S>) {
    while !ctx.signal.wait(ctx.heartbeat_interval) {
        match ctx.dispatcher.heartbeat(ctx.worker_id()) {
            Ok(status) if status.status == WorkerState::Offline => {
                warn!(worker_id = %ctx.worker_id(), "worker was marked offline; registering again");
                reregister(ctx);
            }
            Ok(_) => {}
            Err(QueueError::NotFound(_)) => reregister(ctx),
            Err(e) => error!(worker_id = %ctx.worker_id(), error = %e, "heartbeat failed"),
        }
    }
}

fn reregister<S: JobQueueStore>(ctx: &WorkerContext<S>) {
    if let Err(e) = ctx.dispatcher.registry().register(ctx.registration.clone()) {
        error!(worker_id = %ctx.worker_id(), error = %e, "re-registration failed");
    }
}

fn execution_loop<S: JobQueueStore>(ctx: &WorkerContext<S>) {
    let service_types = &ctx.registration.supported_service_types;
    let capacity = ctx.registration.max_concurrent_jobs;

    while !ctx.signal.is_triggered() {
        match ctx.dispatcher.claim_next(ctx.worker_id(), service_types, capacity) {
            Ok(Some(job)) => run_job(ctx, job),
            Ok(None) => {
                if ctx.signal.wait(ctx.poll_interval) {
                    break;
                }
            }
            Err(e) => {
                warn!(worker_id = %ctx.worker_id(), error = %e, "claim failed");
                if ctx.signal.wait(ctx.poll_interval) {
                    break;
                }
            }
        }
    }
}

fn run_job<S: JobQueueStore>(ctx: &WorkerContext<S>, job: ProvisioningJob) {
    info!(
        worker_id = %ctx.worker_id(),
        job_id = %job.job_id,
        service_type = %job.service_type,
        retry_count = job.retry_count,
        "executing job"
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.executors.execute(&job, &ctx.cancel)
    }))
    .unwrap_or_else(|payload| {
        Err(ExecutorError::permanent(format!(
            "executor panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    let reported = match outcome {
        Ok(result) => ctx.dispatcher.complete(ctx.worker_id(), job.job_id, result),
        Err(err) if ctx.cancel.is_cancelled() => {
            // Interrupted by shutdown, not a failure of the job itself.
            match ctx.dispatcher.release_interrupted(ctx.worker_id(), job.job_id) {
                Ok(requeued) => {
                    info!(job_id = %job.job_id, requeued, error = %err, "job handed back on shutdown");
                }
                Err(e) => warn!(job_id = %job.job_id, error = %e, "failed to hand back job"),
            }
            return;
        }
        Err(err) => ctx.dispatcher.fail(ctx.worker_id(), job.job_id, &err),
    };

    match reported {
        Ok(job) => debug!(job_id = %job.job_id, status = %job.status, "job outcome recorded"),
        Err(e) => warn!(job_id = %job.job_id, error = %e, "job outcome rejected"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
