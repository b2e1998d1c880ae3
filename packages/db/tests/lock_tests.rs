#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use db::{ConnectionGate, DbConfig, DbError, DistributedLock, WriteSection};

#[tokio::test]
async fn second_acquirer_times_out_while_the_lock_is_held() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let held = storage
        .acquire_distributed_lock("R", Duration::from_secs(5))
        .await?;
    assert_eq!(held.resource(), "R");

    let started = Instant::now();
    let contender = storage
        .acquire_distributed_lock("R", Duration::from_millis(200))
        .await;
    assert!(matches!(
        contender,
        Err(DbError::DistributedLockTimeout { ref resource, .. }) if resource == "R"
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));

    held.release().await?;
    let after_release = storage
        .acquire_distributed_lock("R", Duration::from_millis(200))
        .await?;
    after_release.release().await?;
    Ok(())
}

#[tokio::test]
async fn blocked_acquirer_proceeds_once_released() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let held = storage
        .acquire_distributed_lock("R", Duration::from_secs(5))
        .await?;

    let waiter = {
        let storage = storage.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let handle = storage
                .acquire_distributed_lock("R", Duration::from_secs(5))
                .await?;
            let waited = started.elapsed();
            handle.release().await?;
            Ok::<_, DbError>(waited)
        })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    held.release().await?;

    let waited = waiter.await??;
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn distinct_resources_do_not_contend() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let a = storage
        .acquire_distributed_lock("alpha", Duration::from_millis(100))
        .await?;
    let b = storage
        .acquire_distributed_lock("beta", Duration::from_millis(100))
        .await?;

    assert_ne!(a.owner(), b.owner());
    a.release().await?;
    b.release().await?;
    Ok(())
}

#[tokio::test]
async fn abandoned_lock_is_evicted_after_its_lifetime() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;
    let lifetime = storage.options().distributed_lock_lifetime();

    let abandoned = storage
        .acquire_distributed_lock("R", Duration::from_secs(1))
        .await?;
    // Simulate a crashed holder: the handle is never released.
    std::mem::forget(abandoned);

    clock.advance(lifetime - Duration::from_secs(1));
    let too_early = storage
        .acquire_distributed_lock("R", Duration::from_millis(100))
        .await;
    assert!(matches!(too_early, Err(DbError::DistributedLockTimeout { .. })));

    clock.advance(Duration::from_secs(2));
    let recovered = storage
        .acquire_distributed_lock("R", Duration::from_millis(100))
        .await?;
    recovered.release().await?;
    Ok(())
}

#[tokio::test]
async fn renewed_lock_is_not_evicted() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;
    let lifetime = storage.options().distributed_lock_lifetime();

    let held = storage
        .acquire_distributed_lock("R", Duration::from_secs(1))
        .await?;
    clock.advance(lifetime - Duration::from_secs(1));
    assert!(held.renew().await?);
    clock.advance(Duration::from_secs(2));

    let contender = storage
        .acquire_distributed_lock("R", Duration::from_millis(100))
        .await;
    assert!(matches!(contender, Err(DbError::DistributedLockTimeout { .. })));

    held.release().await?;
    Ok(())
}

#[tokio::test]
async fn dropping_a_handle_releases_the_lock() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    {
        let _held = storage
            .acquire_distributed_lock("R", Duration::from_secs(1))
            .await?;
    }

    let next = storage
        .acquire_distributed_lock("R", Duration::from_secs(2))
        .await?;
    next.release().await?;
    Ok(())
}

#[tokio::test]
async fn blank_resource_is_rejected() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let result = storage
        .acquire_distributed_lock("  ", Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(DbError::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_the_backoff() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let lock = storage.distributed_lock();

    let held = lock.acquire("R", Duration::from_secs(1)).await?;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = lock
        .acquire_cancellable("R", Duration::from_secs(10), &cancel)
        .await;
    assert!(matches!(result, Err(DbError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));

    held.release().await?;
    Ok(())
}

#[tokio::test]
async fn failed_release_is_retried_when_the_handle_drops() -> Result<(), Box<dyn Error>> {
    let config = DbConfig::memory();
    let db = db::open(&config).await?;
    db::init_schema(&db).await?;

    let section = Arc::new(
        WriteSection::new(config.identity()).with_timeout(Duration::from_millis(200)),
    );
    let gate = ConnectionGate::with_handle(config, db, section.clone());
    let lock = DistributedLock::new(
        gate,
        Arc::new(common::test_clock()),
        Duration::from_secs(60),
    );

    let held = lock.acquire("R", Duration::from_secs(1)).await?;

    let writer = section.enter().await?;
    let released = held.release().await;
    assert!(matches!(released, Err(DbError::LockTimeout { .. })));
    drop(writer);

    // The row is gone well before the 60 s lifetime would evict it.
    let reacquired = lock.acquire("R", Duration::from_secs(5)).await?;
    reacquired.release().await?;
    Ok(())
}
