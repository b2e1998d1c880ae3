//! Batched removal of expired bookkeeping and job records.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{Clock, StorageOptions};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{DistributedLock, DistributedLockHandle};
use crate::schema::EXPIRABLE_TABLES;
use crate::{ConnectionGate, DbError};

/// Maximum rows removed by one delete batch.
pub const EXPIRATION_BATCH_SIZE: usize = 1000;

/// Distributed lock serializing sweeps across processes.
pub const EXPIRATION_LOCK_RESOURCE: &str = "expiration-sweeper";

/// Select a bounded batch of expired ids, then delete them. The delete
/// re-checks the predicate in case a row was persisted in between.
const DELETE_EXPIRED_BATCH: &str = r#"
LET $expired = (SELECT VALUE id FROM type::table($table) WHERE expire_at != NONE AND expire_at < $now LIMIT $limit);
DELETE $expired WHERE expire_at != NONE AND expire_at < $now RETURN BEFORE;
"#;

#[derive(Debug, Deserialize)]
struct ExpiredRecord {
    #[serde(default)]
    #[allow(dead_code)]
    expire_at: Option<i64>,
}

/// Outcome of sweeping one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySweep {
    pub table: &'static str,
    pub deleted: usize,
    /// Delete batches that removed at least one row.
    pub batches: usize,
}

/// Outcome of one full pass over every expirable table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub families: Vec<FamilySweep>,
}

impl SweepReport {
    pub fn total_deleted(&self) -> usize {
        self.families.iter().map(|f| f.deleted).sum()
    }

    pub fn family(&self, table: &str) -> Option<&FamilySweep> {
        self.families.iter().find(|f| f.table == table)
    }
}

/// Periodically deletes rows whose `expire_at` has passed.
///
/// Each batch runs in its own write-intent section, so queue writers are
/// never held off for more than one batch at a time.
#[derive(Clone)]
pub struct ExpirationSweeper {
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
    lock: DistributedLock,
    batch_size: usize,
    batch_pause: Duration,
    check_interval: Duration,
    lock_timeout: Duration,
}

impl ExpirationSweeper {
    pub fn new(
        gate: ConnectionGate,
        clock: Arc<dyn Clock>,
        lock: DistributedLock,
        options: &StorageOptions,
    ) -> Self {
        Self {
            gate,
            clock,
            lock,
            batch_size: EXPIRATION_BATCH_SIZE,
            batch_pause: options.expiration_batch_pause(),
            check_interval: options.job_expiration_check_interval(),
            lock_timeout: options.maintenance_lock_timeout(),
        }
    }

    /// Override the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Sweep until cancelled, pausing `job_expiration_check_interval`
    /// between passes. A failed pass is logged and retried on the next one.
    pub async fn run(&self, cancel: &CancellationToken) {
        tracing::info!(
            "Expiration sweeper started (interval {:?}, batch size {})",
            self.check_interval,
            self.batch_size
        );

        loop {
            match self.run_once(cancel).await {
                Ok(report) => {
                    if report.total_deleted() > 0 {
                        tracing::info!("Expiration pass removed {} records", report.total_deleted());
                    }
                }
                Err(DbError::Cancelled) => break,
                Err(DbError::DistributedLockTimeout { .. }) => {
                    tracing::debug!("Another process is sweeping; skipping this pass");
                }
                Err(e) => {
                    tracing::warn!("Expiration pass failed, retrying next interval: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }

        tracing::info!("Expiration sweeper stopped");
    }

    /// One pass over every expirable table, holding the sweeper lock.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SweepReport, DbError> {
        let handle = self
            .lock
            .acquire_cancellable(EXPIRATION_LOCK_RESOURCE, self.lock_timeout, cancel)
            .await?;

        let result = self.sweep_all(&handle, cancel).await;

        if let Err(e) = handle.release().await {
            tracing::warn!("Failed to release expiration lock: {}", e);
        }

        result
    }

    async fn sweep_all(
        &self,
        handle: &DistributedLockHandle,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, DbError> {
        let mut report = SweepReport::default();

        for table in EXPIRABLE_TABLES {
            let family = self.sweep_family(table, handle, cancel).await?;
            if family.deleted > 0 {
                tracing::debug!(
                    "Removed {} expired rows from '{}' in {} batches",
                    family.deleted,
                    table,
                    family.batches
                );
            }
            report.families.push(family);
        }

        Ok(report)
    }

    async fn sweep_family(
        &self,
        table: &'static str,
        handle: &DistributedLockHandle,
        cancel: &CancellationToken,
    ) -> Result<FamilySweep, DbError> {
        let mut family = FamilySweep {
            table,
            deleted: 0,
            batches: 0,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }

            let deleted = self.delete_batch(table).await?;
            if deleted == 0 {
                return Ok(family);
            }
            family.deleted += deleted;
            family.batches += 1;

            if !handle.renew().await? {
                tracing::warn!("Expiration lock was taken over while sweeping '{}'", table);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DbError::Cancelled),
                _ = tokio::time::sleep(self.batch_pause) => {}
            }
        }
    }

    async fn delete_batch(&self, table: &'static str) -> Result<usize, DbError> {
        let now = self.clock.now_millis();
        let limit = self.batch_size as i64;

        self.gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(DELETE_EXPIRED_BATCH)
                    .bind(("table", table))
                    .bind(("now", now))
                    .bind(("limit", limit))
                    .await?;
                let deleted: Vec<ExpiredRecord> = response.take(1)?;
                Ok(deleted.len())
            })
            .await
    }
}
