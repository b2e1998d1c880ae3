//! Tunables for the queue storage.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for storage behavior.
///
/// The `with_*` builders round up to the field's unit: a 1.5 s lease is stored
/// as 2 s, never as 1 s. Durations past `u64::MAX` units saturate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// How long a worker waits before polling an empty queue again (milliseconds).
    pub queue_poll_interval_ms: u64,
    /// Lease length: a claimed entry becomes fetchable again after this long (seconds).
    pub invisibility_timeout_secs: u64,
    /// Delay between two full expiration passes (seconds).
    pub job_expiration_check_interval_secs: u64,
    /// Pause between two non-empty expiration batches (milliseconds).
    pub expiration_batch_pause_ms: u64,
    /// Age after which a distributed lock row is considered abandoned (seconds).
    pub distributed_lock_lifetime_secs: u64,
    /// How long the sweeper waits for the maintenance lock (seconds).
    pub maintenance_lock_timeout_secs: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            queue_poll_interval_ms: 15_000,
            invisibility_timeout_secs: 30 * 60,
            job_expiration_check_interval_secs: 60 * 60,
            expiration_batch_pause_ms: 1_000,
            distributed_lock_lifetime_secs: 60,
            maintenance_lock_timeout_secs: 5,
        }
    }
}

/// Invalid storage option values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Whole seconds, rounding any fraction up.
fn ceil_secs(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0))
}

/// Whole milliseconds, rounding any fraction up.
fn ceil_millis(duration: Duration) -> u64 {
    let millis = duration.as_millis() + u128::from(duration.subsec_nanos() % 1_000_000 > 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

impl StorageOptions {
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn invisibility_timeout(&self) -> Duration {
        Duration::from_secs(self.invisibility_timeout_secs)
    }

    pub fn job_expiration_check_interval(&self) -> Duration {
        Duration::from_secs(self.job_expiration_check_interval_secs)
    }

    pub fn expiration_batch_pause(&self) -> Duration {
        Duration::from_millis(self.expiration_batch_pause_ms)
    }

    pub fn distributed_lock_lifetime(&self) -> Duration {
        Duration::from_secs(self.distributed_lock_lifetime_secs)
    }

    pub fn maintenance_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.maintenance_lock_timeout_secs)
    }

    /// Set the poll interval.
    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval_ms = ceil_millis(interval);
        self
    }

    /// Set the lease length of fetched entries.
    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout_secs = ceil_secs(timeout);
        self
    }

    /// Set the delay between expiration passes.
    pub fn with_job_expiration_check_interval(mut self, interval: Duration) -> Self {
        self.job_expiration_check_interval_secs = ceil_secs(interval);
        self
    }

    /// Set the pause between expiration batches.
    pub fn with_expiration_batch_pause(mut self, pause: Duration) -> Self {
        self.expiration_batch_pause_ms = ceil_millis(pause);
        self
    }

    /// Set the abandoned-lock age.
    pub fn with_distributed_lock_lifetime(mut self, lifetime: Duration) -> Self {
        self.distributed_lock_lifetime_secs = ceil_secs(lifetime);
        self
    }

    /// Check that every interval is usable.
    ///
    /// The batch pause may be zero; everything else would either spin or make
    /// every claim immediately reclaimable.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.queue_poll_interval_ms == 0 {
            return Err(OptionsError::Zero("queue_poll_interval_ms"));
        }
        if self.invisibility_timeout_secs == 0 {
            return Err(OptionsError::Zero("invisibility_timeout_secs"));
        }
        if self.job_expiration_check_interval_secs == 0 {
            return Err(OptionsError::Zero("job_expiration_check_interval_secs"));
        }
        if self.distributed_lock_lifetime_secs == 0 {
            return Err(OptionsError::Zero("distributed_lock_lifetime_secs"));
        }
        Ok(())
    }
}
