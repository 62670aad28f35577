//! Executor contract: the per-service-type component that changes the network.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{ProvisioningJob, ServiceType};

/// Failure reported by an executor. `retryable` drives the retry decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ExecutorError {
    /// Transient failure (device unreachable, RADIUS timeout, pool busy).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            retryable: true,
        }
    }

    /// Failure that will not go away on retry (bad parameters, unsupported model).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Cooperative cancellation flag. Executors poll it between steps; nothing is
/// interrupted forcibly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Performs the network-side action for one claimed job.
pub trait ProvisioningExecutor: Send + Sync {
    fn execute(
        &self,
        job: &ProvisioningJob,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError>;
}

impl<F> ProvisioningExecutor for F
where
    F: Fn(&ProvisioningJob, &CancellationToken) -> Result<Value, ExecutorError> + Send + Sync,
{
    fn execute(
        &self,
        job: &ProvisioningJob,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError> {
        self(job, cancel)
    }
}

/// Routes jobs to the executor registered for their service type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ServiceType, Arc<dyn ProvisioningExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E>(&mut self, service_type: ServiceType, executor: E)
    where
        E: ProvisioningExecutor + 'static,
    {
        self.executors.insert(service_type, Arc::new(executor));
    }

    pub fn with<E>(mut self, service_type: ServiceType, executor: E) -> Self
    where
        E: ProvisioningExecutor + 'static,
    {
        self.register(service_type, executor);
        self
    }

    pub fn get(&self, service_type: ServiceType) -> Option<Arc<dyn ProvisioningExecutor>> {
        self.executors.get(&service_type).cloned()
    }

    pub fn supported_types(&self) -> BTreeSet<ServiceType> {
        self.executors.keys().copied().collect()
    }

    /// Run the matching executor; a missing one is a permanent failure.
    pub fn execute(
        &self,
        job: &ProvisioningJob,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError> {
        match self.executors.get(&job.service_type) {
            Some(executor) => executor.execute(job, cancel),
            None => Err(ExecutorError::permanent(format!(
                "no executor registered for service type {}",
                job.service_type
            ))),
        }
    }
}

impl core::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("service_types", &self.supported_types())
            .finish()
    }
}
