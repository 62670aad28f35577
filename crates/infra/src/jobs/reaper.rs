//! Background thread that periodically sweeps for crashed workers.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use super::registry::WorkerRegistry;
use super::store::JobQueueStore;
use crate::config::QueueConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Worker silence that counts as a crash
    pub heartbeat_timeout: Duration,
    /// Sweep period
    pub interval: Duration,
    /// Thread name for logging
    pub name: String,
}

impl From<&QueueConfig> for ReaperConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            interval: config.reap_interval,
            name: "ispadmin-reaper".to_string(),
        }
    }
}

/// Handle to a running reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop sweeping and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

pub struct Reaper;

impl Reaper {
    /// Spawn the sweep loop. The first sweep runs one `interval` after start.
    pub fn spawn<S>(
        registry: Arc<WorkerRegistry<S>>,
        config: ReaperConfig,
    ) -> std::io::Result<ReaperHandle>
    where
        S: JobQueueStore + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || reaper_loop(&registry, &config, &shutdown_rx))?;

        Ok(ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn reaper_loop<S: JobQueueStore>(
    registry: &WorkerRegistry<S>,
    config: &ReaperConfig,
    shutdown: &mpsc::Receiver<()>,
) {
    info!(
        name = %config.name,
        interval_ms = config.interval.as_millis() as u64,
        timeout_ms = config.heartbeat_timeout.as_millis() as u64,
        "reaper started"
    );

    loop {
        match shutdown.recv_timeout(config.interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if let Err(e) = registry.reap(config.heartbeat_timeout) {
            error!(error = %e, "reaper sweep failed");
        }
    }

    info!(name = %config.name, "reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::InMemoryJobQueueStore;
    use ispadmin_core::WorkerId;
    use ispadmin_provisioning::{EnqueueRequest, JobStatus, ServiceType, WorkerRegistration};
    use std::collections::BTreeSet;
    use std::time::Instant;

    #[test]
    fn background_sweep_requeues_jobs_of_silent_workers() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryJobQueueStore::with_clock(
            &QueueConfig::default(),
            Arc::new(clock.clone()),
        ));
        let registry = Arc::new(WorkerRegistry::new(store.clone(), Arc::new(clock.clone())));

        let w = WorkerId::parse("edge-1").unwrap();
        registry
            .register(WorkerRegistration::new(w.clone(), "edge", ServiceType::ALL, 1))
            .unwrap();
        let job_id = store
            .enqueue(EnqueueRequest::new("svc", "internet", "cust"))
            .unwrap();
        let all: BTreeSet<_> = ServiceType::ALL.into_iter().collect();
        store.claim_next(&w, &all).unwrap().unwrap();
        registry.commit_claim(&w, job_id).unwrap();

        clock.advance(Duration::from_secs(600));

        let handle = Reaper::spawn(
            registry.clone(),
            ReaperConfig {
                heartbeat_timeout: Duration::from_secs(90),
                interval: Duration::from_millis(10),
                name: "test-reaper".to_string(),
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(job_id).unwrap().status != JobStatus::Queued && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Queued);
        assert!(!registry.get(&w).unwrap().is_online());
    }
}
