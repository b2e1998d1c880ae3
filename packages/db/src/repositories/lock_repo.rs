//! Cross-process mutual exclusion built on a uniquely keyed lock row.
//!
//! A lock is the record `distributed_lock:<resource>`. Creating it succeeds
//! for exactly one caller; everyone else sees "record already exists" and
//! backs off. A holder that crashes leaves its row behind, so rows older than
//! the configured lifetime are evicted by the next acquirer.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{Clock, OwnerToken, millis_before};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{ConnectionGate, DbError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct LockRecord {
    owner: String,
    acquired_at: i64,
}

/// Exponential delay between contended acquisition attempts.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }
}

/// Factory for named distributed locks on one store.
#[derive(Clone)]
pub struct DistributedLock {
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
    lifetime: Duration,
}

impl DistributedLock {
    pub fn new(gate: ConnectionGate, clock: Arc<dyn Clock>, lifetime: Duration) -> Self {
        Self {
            gate,
            clock,
            lifetime,
        }
    }

    /// Acquire `resource`, waiting up to `timeout` while another holder has it.
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<DistributedLockHandle, DbError> {
        self.acquire_inner(resource, timeout, None).await
    }

    /// Like [`DistributedLock::acquire`], but gives up with `Cancelled` when
    /// `cancel` fires during a backoff.
    pub async fn acquire_cancellable(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DistributedLockHandle, DbError> {
        self.acquire_inner(resource, timeout, Some(cancel)).await
    }

    async fn acquire_inner(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<DistributedLockHandle, DbError> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(DbError::InvalidArgument(
                "lock resource name must not be empty".into(),
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();

        loop {
            let owner = OwnerToken::new();
            match self.try_acquire(resource, owner).await {
                Ok(true) => {
                    tracing::debug!("Acquired distributed lock '{}' ({})", resource, owner);
                    return Ok(DistributedLockHandle {
                        resource: resource.to_string(),
                        owner,
                        gate: self.gate.clone(),
                        clock: self.clock.clone(),
                        released: false,
                    });
                }
                Ok(false) => {}
                // Local writers are busy; same outcome as a held lock.
                Err(DbError::LockTimeout { .. }) => {}
                Err(e) => {
                    return Err(DbError::DistributedLockUnavailable {
                        resource: resource.to_string(),
                        reason: e.to_string(),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DbError::DistributedLockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            let delay = backoff.next_delay().min(deadline - now);

            match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => return Err(DbError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// One attempt: evict an abandoned row, then try to create ours.
    async fn try_acquire(&self, resource: &str, owner: OwnerToken) -> Result<bool, DbError> {
        let resource = resource.to_string();
        let now = self.clock.now_millis();
        let stale_before = millis_before(now, self.lifetime);

        self.gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(
                        "DELETE type::thing('distributed_lock', $resource) WHERE acquired_at < $stale_before RETURN BEFORE",
                    )
                    .bind(("resource", resource.clone()))
                    .bind(("stale_before", stale_before))
                    .await?;
                let evicted: Vec<LockRecord> = response.take(0)?;
                for stale in evicted {
                    tracing::warn!(
                        "Evicted abandoned distributed lock '{}' held by {} since {}",
                        resource,
                        stale.owner,
                        stale.acquired_at
                    );
                }

                let created = db
                    .query(
                        "CREATE type::thing('distributed_lock', $resource) SET resource = $resource, owner = $owner, acquired_at = $now",
                    )
                    .bind(("resource", resource.clone()))
                    .bind(("owner", owner.to_string()))
                    .bind(("now", now))
                    .await?
                    .check();

                match created {
                    Ok(_) => Ok(true),
                    Err(create_error) => {
                        // A failed create is contention only if the row exists.
                        let mut response = db
                            .query("SELECT owner, acquired_at FROM type::thing('distributed_lock', $resource)")
                            .bind(("resource", resource.clone()))
                            .await?;
                        let holders: Vec<LockRecord> = response.take(0)?;
                        if holders.is_empty() {
                            Err(DbError::from(create_error))
                        } else {
                            Ok(false)
                        }
                    }
                }
            })
            .await
    }
}

/// A held distributed lock.
///
/// Call [`DistributedLockHandle::release`] to give it up. Dropping the handle
/// without releasing schedules the release on the current tokio runtime; if
/// there is none, the row is evicted once it outlives the lock lifetime.
pub struct DistributedLockHandle {
    resource: String,
    owner: OwnerToken,
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
    released: bool,
}

impl DistributedLockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// Release the lock. If the delete fails, dropping the handle retries it.
    pub async fn release(mut self) -> Result<(), DbError> {
        delete_owned(&self.gate, &self.resource, self.owner).await?;
        self.released = true;
        tracing::debug!("Released distributed lock '{}'", self.resource);
        Ok(())
    }

    /// Refresh the acquisition time so a long critical section is not
    /// mistaken for an abandoned one. Returns `false` if the lock was lost.
    pub async fn renew(&self) -> Result<bool, DbError> {
        let resource = self.resource.clone();
        let owner = self.owner.to_string();
        let now = self.clock.now_millis();

        self.gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(
                        "UPDATE type::thing('distributed_lock', $resource) SET acquired_at = $now WHERE owner = $owner RETURN AFTER",
                    )
                    .bind(("resource", resource))
                    .bind(("owner", owner))
                    .bind(("now", now))
                    .await?;
                let renewed: Vec<LockRecord> = response.take(0)?;
                Ok(!renewed.is_empty())
            })
            .await
    }
}

impl Drop for DistributedLockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let gate = self.gate.clone();
                let resource = self.resource.clone();
                let owner = self.owner;
                runtime.spawn(async move {
                    if let Err(e) = delete_owned(&gate, &resource, owner).await {
                        tracing::warn!("Failed to release distributed lock '{}': {}", resource, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Distributed lock '{}' dropped outside a runtime; it will be evicted after its lifetime",
                    self.resource
                );
            }
        }
    }
}

impl std::fmt::Debug for DistributedLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockHandle")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Delete the lock row if `owner` still holds it.
async fn delete_owned(
    gate: &ConnectionGate,
    resource: &str,
    owner: OwnerToken,
) -> Result<(), DbError> {
    let resource = resource.to_string();
    let owner = owner.to_string();

    gate.with_connection(true, |db| async move {
        db.query("DELETE type::thing('distributed_lock', $resource) WHERE owner = $owner")
            .bind(("resource", resource))
            .bind(("owner", owner))
            .await?
            .check()?;
        Ok(())
    })
    .await
}
