use std::sync::Arc;

use sqlx::PgPool;

use ispadmin_infra::clock::{Clock, SystemClock};
use ispadmin_infra::config::QueueConfig;
use ispadmin_infra::jobs::{
    BlockingPostgresStore, Dispatcher, InMemoryJobQueueStore, JobQueueStore, PostgresJobQueueStore,
    QueueError, Reaper, ReaperConfig, ReaperHandle, WorkerRegistry,
};

pub type Store = Arc<dyn JobQueueStore>;

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Debug)]
pub struct AppServices {
    config: QueueConfig,
    dispatcher: Arc<Dispatcher<Store>>,
}

impl AppServices {
    /// In-memory queue; state is lost on restart.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let store: Store = Arc::new(InMemoryJobQueueStore::with_clock(&config, clock.clone()));
        Self::with_store(config, store, clock)
    }

    pub fn with_store(config: QueueConfig, store: Store, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(WorkerRegistry::new(store.clone(), clock));
        let dispatcher = Arc::new(Dispatcher::new(store, registry));
        Self { config, dispatcher }
    }

    /// Durable queue on Postgres. Creates the schema if needed; must be called
    /// from inside the multi-thread runtime that will serve requests.
    pub async fn postgres(config: QueueConfig, pool: PgPool) -> Result<Self, QueueError> {
        let store = PostgresJobQueueStore::new(pool, &config);
        store.migrate().await?;
        let store: Store = Arc::new(BlockingPostgresStore::new(
            store,
            tokio::runtime::Handle::current(),
        ));
        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<Store>> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Store {
        self.dispatcher.store()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry<Store>> {
        self.dispatcher.registry()
    }

    /// Start the background sweep for silent workers.
    pub fn spawn_reaper(&self) -> std::io::Result<ReaperHandle> {
        Reaper::spawn(self.registry().clone(), ReaperConfig::from(&self.config))
    }
}
