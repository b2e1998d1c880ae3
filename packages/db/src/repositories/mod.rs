//! Repository implementations for database operations.

mod expiration;
mod job_repo;
mod keyvalue_repo;
mod lock_repo;
mod monitoring;
mod queue_repo;

pub use expiration::{
    EXPIRATION_BATCH_SIZE, EXPIRATION_LOCK_RESOURCE, ExpirationSweeper, FamilySweep, SweepReport,
};
pub use job_repo::{JobRepository, StoredJob};
pub use keyvalue_repo::{KeyFamily, KeyValueRepository};
pub use lock_repo::{DistributedLock, DistributedLockHandle};
pub use monitoring::{QueueCounts, QueueMonitoring};
pub use queue_repo::{FetchedJob, SurrealJobQueue};

use serde::Deserialize;

use crate::{Database, DbError};

#[derive(Debug, Deserialize)]
struct SequenceRecord {
    last_value: i64,
}

/// Allocate the next value of a named, monotonically increasing sequence.
///
/// Must run inside a write-intent section so ids are handed out in commit
/// order within this process.
pub(crate) async fn next_sequence(db: &Database, name: &str) -> Result<i64, DbError> {
    let mut response = db
        .query("UPSERT type::thing('id_sequence', $name) SET last_value += 1 RETURN AFTER")
        .bind(("name", name.to_string()))
        .await?;

    let records: Vec<SequenceRecord> = response.take(0)?;

    records
        .into_iter()
        .next()
        .map(|r| r.last_value)
        .ok_or_else(|| DbError::Query(format!("Failed to allocate id from sequence '{}'", name)))
}

/// Stored expiry for a time-to-live starting now.
pub(crate) fn expire_at(now_millis: i64, ttl: std::time::Duration) -> i64 {
    now_millis.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}
