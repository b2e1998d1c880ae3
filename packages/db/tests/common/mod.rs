#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use queue_core::{ManualClock, StorageOptions};

use db::{DbConfig, DbError, Storage};

/// Lease used by fixtures; the clock is moved past it explicitly.
pub const LEASE: Duration = Duration::from_secs(60);

pub fn test_options() -> StorageOptions {
    StorageOptions::default()
        .with_queue_poll_interval(Duration::from_millis(20))
        .with_invisibility_timeout(LEASE)
        .with_expiration_batch_pause(Duration::ZERO)
        .with_distributed_lock_lifetime(Duration::from_secs(60))
}

pub fn test_clock() -> ManualClock {
    ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default())
}

/// A fresh in-memory store driven by a manual clock.
pub async fn setup_storage() -> Result<(Storage, ManualClock), DbError> {
    setup_storage_with(test_options()).await
}

pub async fn setup_storage_with(
    options: StorageOptions,
) -> Result<(Storage, ManualClock), DbError> {
    let clock = test_clock();
    let storage =
        Storage::open_with_clock(DbConfig::memory(), options, Arc::new(clock.clone())).await?;
    Ok((storage, clock))
}

pub fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
