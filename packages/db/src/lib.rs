//! SurrealDB-backed job storage.
//!
//! Workers lease entries from the `job_queue` table, cross-process critical
//! sections are guarded by lock rows, and expired records are removed in
//! bounded batches. Every access goes through a [`ConnectionGate`], which
//! serializes writers per store.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage
//! - `remote`: Connect to a shared SurrealDB server over WebSocket

mod connection;
mod providers;
mod schema;
mod storage;
pub mod repositories;

pub use connection::{
    ConnectionGate, ConnectionLease, Database, DbConfig, DbError, WRITE_LOCK_TIMEOUT,
    WriteSection, open,
};
pub use providers::{PersistentJobQueue, QueueFuture, QueueProviders};
pub use repositories::{
    DistributedLock, DistributedLockHandle, EXPIRATION_BATCH_SIZE, EXPIRATION_LOCK_RESOURCE,
    ExpirationSweeper, FamilySweep, FetchedJob, JobRepository, KeyFamily, KeyValueRepository,
    QueueCounts, QueueMonitoring, StoredJob, SurrealJobQueue, SweepReport,
};
pub use schema::{EXPIRABLE_TABLES, init_schema};
pub use storage::Storage;
