#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::DateTime;
use queue_core::{ManualClock, StorageOptions};

use db::{DbConfig, DbError, Storage};

pub async fn setup_storage() -> Result<(Storage, ManualClock), DbError> {
    let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default());
    let options = StorageOptions::default()
        .with_queue_poll_interval(Duration::from_millis(20))
        .with_expiration_batch_pause(Duration::ZERO);
    let storage =
        Storage::open_with_clock(DbConfig::memory(), options, Arc::new(clock.clone())).await?;
    Ok((storage, clock))
}

/// Poll `check` until it returns true or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> Result<bool, DbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, DbError>>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await? {
            return Ok(true);
        }
        if Instant::now() > deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
