//! Runs against a real PostgreSQL; the tables are truncated first, so point
//! `DATABASE_URL` at a scratch database.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ispadmin_core::WorkerId;
use ispadmin_infra::clock::ManualClock;
use ispadmin_infra::config::QueueConfig;
use ispadmin_infra::jobs::{
    BlockingPostgresStore, Dispatcher, JobQueueStore, PostgresJobQueueStore, WorkerRegistry,
};
use ispadmin_provisioning::{
    Actor, EnqueueRequest, ExecutorError, JobFilter, JobStatus, ProvisioningJob, ServiceType,
    WorkerRegistration, is_consistent_chain,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

async fn connect(clock: &ManualClock) -> (PostgresJobQueueStore, PgPool) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("failed to connect to Postgres");
    let store = PostgresJobQueueStore::with_clock(
        pool.clone(),
        &QueueConfig::default(),
        Arc::new(clock.clone()),
    );
    store.migrate().await.expect("migration failed");
    sqlx::query("TRUNCATE provisioning_job_history, provisioning_jobs RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");
    (store, pool)
}

fn all_types() -> BTreeSet<ServiceType> {
    ServiceType::ALL.into_iter().collect()
}

async fn claim_concurrently(
    store: &PostgresJobQueueStore,
    workers: usize,
) -> Vec<ProvisioningJob> {
    let mut handles = Vec::new();
    for n in 0..workers {
        let store = store.clone();
        let worker = WorkerId::parse(format!("pg-worker-{n}")).unwrap();
        handles.push(tokio::spawn(async move {
            store.claim_next(&worker, &all_types()).await
        }));
    }

    let mut jobs = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap().unwrap() {
            jobs.push(job);
        }
    }
    jobs
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn postgres_queue_end_to_end() {
    let clock = ManualClock::starting_now();
    let (store, _pool) = connect(&clock).await;
    let w = WorkerId::parse("pg-edge-1").unwrap();
    let actor = Actor::Worker(w.clone());

    // Priority order.
    for priority in ["low", "high", "urgent", "normal"] {
        store
            .enqueue(EnqueueRequest::new("svc", "internet", "cust-a").with_priority(priority))
            .await
            .unwrap();
    }
    let mut order = Vec::new();
    while let Some(job) = store.claim_next(&w, &all_types()).await.unwrap() {
        order.push(job.priority.as_str());
        store.complete(job.job_id, serde_json::json!({}), &actor).await.unwrap();
    }
    assert_eq!(order, vec!["urgent", "high", "normal", "low"]);

    // Racing claimers never share a row.
    for n in 0..6 {
        store
            .enqueue(EnqueueRequest::new(format!("svc-{n}"), "voice", "cust-b"))
            .await
            .unwrap();
    }
    let claimed = claim_concurrently(&store, 10).await;
    let unique: BTreeSet<_> = claimed.iter().map(|j| j.job_id).collect();
    assert_eq!(claimed.len(), 6);
    assert_eq!(unique.len(), 6);
    assert_eq!(store.stats().await.unwrap().processing, 6);
    assert_eq!(store.in_flight().await.unwrap().len(), 6);

    // Retry, then crash recovery.
    let job_id = store
        .enqueue(
            EnqueueRequest::new("svc-r", "bundle", "cust-c")
                .with_priority("urgent")
                .with_max_retries(1),
        )
        .await
        .unwrap();
    let types: BTreeSet<_> = [ServiceType::Bundle].into_iter().collect();

    store.claim_next(&w, &types).await.unwrap().unwrap();
    let retried = store
        .fail(job_id, &ExecutorError::retryable("olt busy"), &actor)
        .await
        .unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.retry_count, 1);
    assert!(store.claim_next(&w, &types).await.unwrap().is_none());

    clock.advance(Duration::from_secs(3600));
    store.claim_next(&w, &types).await.unwrap().unwrap();
    assert!(store.requeue_stalled(job_id, &w, "heartbeat lapsed", &Actor::Reaper).await.unwrap());
    assert!(!store.requeue_stalled(job_id, &w, "heartbeat lapsed", &Actor::Reaper).await.unwrap());

    let job = store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert!(job.assigned_worker_id.is_none());

    let history = store.history(job_id).await.unwrap();
    assert_eq!(history.len(), 4);
    assert!(is_consistent_chain(&history));
    assert_eq!(history[3].created_by, "reaper");

    // Cancellation and listing.
    let cancelled = store.cancel(job_id, &Actor::caller("noc")).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(store.cancel(job_id, &Actor::caller("noc")).await.unwrap_err().is_conflict());

    let completed = store
        .list(&JobFilter::default().with_status(JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 4);

    // Dispatcher, registry and reaper over the blocking adapter.
    let store = Arc::new(BlockingPostgresStore::new(
        store.clone(),
        tokio::runtime::Handle::current(),
    ));
    let registry = Arc::new(WorkerRegistry::new(store.clone(), Arc::new(clock.clone())));
    let dispatcher = Dispatcher::new(store.clone(), registry.clone());
    let edge = WorkerId::parse("pg-edge-2").unwrap();
    registry
        .register(WorkerRegistration::new(edge.clone(), "pg-edge-2", ServiceType::ALL, 1))
        .unwrap();

    let job_id = store
        .enqueue(EnqueueRequest::new("svc-d", "internet", "cust-d").with_priority("urgent"))
        .unwrap();
    let claimed = dispatcher.claim_next(&edge, &all_types(), 1).unwrap().unwrap();
    assert_eq!(claimed.job_id, job_id);

    clock.advance(Duration::from_secs(600));
    let report = registry.reap(Duration::from_secs(60)).unwrap();
    assert!(report.workers_marked_offline.contains(&edge));
    assert!(report.jobs_requeued.contains(&job_id));

    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 0);
    assert!(dispatcher.complete(&edge, job_id, serde_json::json!({})).is_err());
}
