//! Provisioning job queue: storage, dispatch, worker liveness and recovery.
//!
//! ## Design
//!
//! - Jobs are typed by service (internet, voice, bundle) and prioritised
//! - Claims are atomic; two workers never hold the same job
//! - Failures retry with exponential backoff until `max_retries`
//! - Every status change lands in an append-only history
//! - Jobs of crashed workers are requeued by the reaper without spending a retry
//!
//! ## Components
//!
//! - `JobQueueStore`: system of record (in-memory or Postgres)
//! - `BlockingPostgresStore`: the Postgres store behind the synchronous trait
//! - `JobHistoryLog`: append-only transition ledger for the in-memory store
//! - `WorkerRegistry`: worker identity, capacity and heartbeats
//! - `Dispatcher`: claim/complete/fail entry point used by workers
//! - `Reaper`: background sweep for silent workers

pub mod blocking;
pub mod dispatcher;
pub mod history;
pub mod postgres;
pub mod reaper;
pub mod registry;
pub mod store;

pub use blocking::BlockingPostgresStore;
pub use dispatcher::Dispatcher;
pub use history::JobHistoryLog;
pub use postgres::PostgresJobQueueStore;
pub use reaper::{Reaper, ReaperConfig, ReaperHandle};
pub use registry::{HeartbeatTimeout, ReapReport, Reservation, WorkerRegistry};
pub use store::{InMemoryJobQueueStore, JobQueueStore, JobStats, QueueError};
