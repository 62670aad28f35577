//! `ispadmin-provisioning`: the provisioning job domain.
//!
//! Pure types and rules for service provisioning jobs: the job record and its
//! state machine, retry/backoff policy, the transition history entry, worker
//! liveness records and the executor contract. Storage and scheduling live in
//! `ispadmin-infra`.

pub mod executor;
pub mod history;
pub mod job;
pub mod retry;
pub mod worker;

pub use executor::{CancellationToken, ExecutorError, ExecutorRegistry, ProvisioningExecutor};
pub use history::{Actor, JobHistoryEntry, Transition, is_consistent_chain};
pub use job::{
    EnqueueRequest, JobFilter, JobStatus, NewJob, Priority, ProvisioningJob, ServiceType,
};
pub use retry::RetryPolicy;
pub use worker::{WorkerRegistration, WorkerState, WorkerStatus};
