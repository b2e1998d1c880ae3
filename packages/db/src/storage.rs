//! Entry point tying the gate, queue backends and repositories together.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{Clock, EntryId, JobId, StorageOptions, SystemClock};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionGate, Database, DbConfig, WriteSection, open};
use crate::providers::{PersistentJobQueue, QueueProviders};
use crate::repositories::{
    DistributedLock, DistributedLockHandle, ExpirationSweeper, FetchedJob, JobRepository,
    KeyValueRepository, QueueMonitoring, SurrealJobQueue,
};
use crate::schema::init_schema;
use crate::DbError;

/// Job storage on one SurrealDB database.
///
/// Cheap to clone; clones share the handle and the write section.
#[derive(Clone)]
pub struct Storage {
    gate: ConnectionGate,
    options: StorageOptions,
    clock: Arc<dyn Clock>,
    queue: SurrealJobQueue,
    providers: Arc<QueueProviders>,
}

impl Storage {
    /// Connect, provision the schema and use the system clock.
    pub async fn open(config: DbConfig, options: StorageOptions) -> Result<Self, DbError> {
        Self::open_with_clock(config, options, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        config: DbConfig,
        options: StorageOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        options.validate()?;

        let db = open(&config).await?;
        init_schema(&db).await?;

        let section = Arc::new(WriteSection::new(config.identity()));
        let gate = if config.is_embedded() {
            ConnectionGate::with_handle(config, db, section)
        } else {
            ConnectionGate::per_operation(config, section)
        };

        tracing::info!("Job storage ready on {}", gate.config().identity());
        Ok(Self::from_gate(gate, options, clock))
    }

    /// Build storage around an already connected handle. The schema must
    /// already be provisioned.
    pub fn from_handle(
        config: DbConfig,
        db: Database,
        options: StorageOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        options.validate()?;
        let section = Arc::new(WriteSection::new(config.identity()));
        let gate = ConnectionGate::with_handle(config, db, section);
        Ok(Self::from_gate(gate, options, clock))
    }

    fn from_gate(gate: ConnectionGate, options: StorageOptions, clock: Arc<dyn Clock>) -> Self {
        let queue = SurrealJobQueue::new(gate.clone(), clock.clone(), &options);
        let providers = QueueProviders::new(Arc::new(queue.clone()));

        Self {
            gate,
            options,
            clock,
            queue,
            providers: Arc::new(providers),
        }
    }

    /// Serve `queues` from `provider` instead of the `job_queue` table.
    pub fn register_queue_provider<I, S>(
        &mut self,
        queues: I,
        provider: Arc<dyn PersistentJobQueue>,
    ) -> Result<(), DbError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Arc::make_mut(&mut self.providers).register(queues, provider)
    }

    pub fn queue_providers(&self) -> &QueueProviders {
        &self.providers
    }

    pub async fn enqueue(&self, queue: &str, job_id: &JobId) -> Result<EntryId, DbError> {
        let provider = self.providers.provider_for(queue.trim());
        provider.enqueue(queue, job_id).await
    }

    /// Claim the oldest eligible entry across `queues`, waiting until one
    /// appears or `cancel` fires. All of `queues` must share one provider.
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DbError> {
        let provider = self.providers.resolve(queues)?;
        provider.dequeue(queues, cancel).await
    }

    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<DistributedLockHandle, DbError> {
        self.distributed_lock().acquire(resource, timeout).await
    }

    pub fn distributed_lock(&self) -> DistributedLock {
        DistributedLock::new(
            self.gate.clone(),
            self.clock.clone(),
            self.options.distributed_lock_lifetime(),
        )
    }

    pub fn expiration_sweeper(&self) -> ExpirationSweeper {
        ExpirationSweeper::new(
            self.gate.clone(),
            self.clock.clone(),
            self.distributed_lock(),
            &self.options,
        )
    }

    pub fn job_queue(&self) -> &SurrealJobQueue {
        &self.queue
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.gate.clone(), self.clock.clone())
    }

    pub fn key_values(&self) -> KeyValueRepository {
        KeyValueRepository::new(self.gate.clone(), self.clock.clone())
    }

    pub fn monitoring(&self) -> QueueMonitoring {
        QueueMonitoring::new(self.gate.clone())
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
