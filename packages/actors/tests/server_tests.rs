#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use queue_core::{JobId, StorageOptions};
use tokio::sync::mpsc;

use actors::{
    ActorError, FnHandler, HandlerFuture, JobContext, JobHandlerRegistry, ServerOptions,
    job_handler, start_server,
};
use db::{DbConfig, Storage};

fn options(workers: usize) -> ServerOptions {
    ServerOptions::default()
        .with_queues(["default"])
        .with_worker_count(workers)
        .with_retry_delay(Duration::from_millis(10))
        .with_sweeper(false)
}

async fn queue_is_empty(storage: &Storage) -> Result<bool, db::DbError> {
    let counts = storage
        .monitoring()
        .enqueued_and_fetched_count("default")
        .await?;
    Ok(counts.enqueued == 0 && counts.fetched == 0)
}

/// Handler that fails its first `failures` attempts.
fn flaky_handler(attempts: Arc<AtomicUsize>, failures: usize) -> impl actors::JobHandler {
    FnHandler::new("default", move |_job: &JobContext| -> HandlerFuture {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if attempt < failures {
                Err(format!("attempt {} failed", attempt))
            } else {
                Ok(())
            }
        })
    })
}

#[tokio::test]
async fn workers_process_and_remove_enqueued_jobs() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<JobId>();

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("default", move |job: &JobContext| -> HandlerFuture {
        let tx = tx.clone();
        let job_id = job.job_id.clone();
        Box::pin(async move { tx.send(job_id).map_err(|e| e.to_string()) })
    }));

    for job in ["a", "b", "c"] {
        storage.enqueue("default", &JobId::from(job)).await?;
    }

    let server = start_server(storage.clone(), handlers, options(2)).await?;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let job = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        seen.extend(job);
    }
    seen.sort();
    assert_eq!(seen, vec![JobId::from("a"), JobId::from("b"), JobId::from("c")]);

    assert!(common::eventually(Duration::from_secs(5), || queue_is_empty(&storage)).await?);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failed_job_is_requeued_and_retried() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(flaky_handler(attempts.clone(), 1));

    storage.enqueue("default", &JobId::from("flaky")).await?;
    let server = start_server(storage.clone(), handlers, options(1)).await?;

    assert!(common::eventually(Duration::from_secs(5), || queue_is_empty(&storage)).await?);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn job_exceeding_its_timeout_is_retried() -> Result<(), Box<dyn Error>> {
    static ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
    let (storage, _clock) = common::setup_storage().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(job_handler!("default", |job| {
        if ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
            tracing::info!("{} will overrun its timeout", job.job_id);
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    }));

    storage.enqueue("default", &JobId::from("slow")).await?;
    let server = start_server(
        storage.clone(),
        handlers,
        options(1).with_job_timeout(Duration::from_millis(50)),
    )
    .await?;

    assert!(common::eventually(Duration::from_secs(5), || queue_is_empty(&storage)).await?);
    assert!(ATTEMPTS.load(Ordering::SeqCst) >= 2);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn server_refuses_queues_without_handlers() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(flaky_handler(Arc::new(AtomicUsize::new(0)), 0));

    let missing = start_server(
        storage.clone(),
        handlers,
        options(1).with_queues(["default", "reports"]),
    )
    .await;
    assert!(matches!(missing, Err(ActorError::Spawn(_))));

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(flaky_handler(Arc::new(AtomicUsize::new(0)), 0));
    let empty = start_server(storage, handlers, options(1).with_queues(Vec::<String>::new())).await;
    assert!(matches!(empty, Err(ActorError::Spawn(_))));
    Ok(())
}

#[tokio::test]
async fn sweeper_child_removes_expired_records() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    kv.increment_counter("stats:succeeded", 1, Some(Duration::from_secs(1)))
        .await?;
    clock.advance(Duration::from_secs(2));

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(flaky_handler(Arc::new(AtomicUsize::new(0)), 0));
    let server = start_server(storage.clone(), handlers, options(1).with_sweeper(true)).await?;

    assert!(server.sweeper_running().await?);
    let swept = common::eventually(Duration::from_secs(5), || {
        let kv = kv.clone();
        async move { Ok(kv.counter_value("stats:succeeded").await? == 0) }
    })
    .await?;
    assert!(swept);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn idle_server_shuts_down_without_waiting_for_the_poll() -> Result<(), Box<dyn Error>> {
    let storage = Storage::open(
        DbConfig::memory(),
        StorageOptions::default().with_queue_poll_interval(Duration::from_secs(30)),
    )
    .await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(flaky_handler(Arc::new(AtomicUsize::new(0)), 0));
    let server = start_server(storage, handlers, options(3).with_sweeper(true)).await?;

    assert_eq!(server.worker_count().await?, 3);
    let token = server.cancellation_token();
    let server_id = server.server_id().to_string();
    let children = [
        format!("{}:worker-1", server_id),
        format!("{}:worker-3", server_id),
        format!("{}:sweeper", server_id),
    ];
    for name in &children {
        assert!(ractor::registry::where_is(name.clone()).is_some());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.shutdown().await?;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(token.is_cancelled());
    for name in &children {
        assert!(ractor::registry::where_is(name.clone()).is_none());
    }
    Ok(())
}
