//! Long-running worker daemons.

pub mod provisioning_worker;

pub use provisioning_worker::{ProvisioningWorker, WorkerConfig, WorkerHandle, WorkerSpawnError};
