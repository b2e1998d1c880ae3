//! Processing server binary.
//!
//! Opens the job storage, starts the workers and the expiration sweeper and
//! runs until Ctrl-C.

mod config;

use std::time::Duration;

use actors::{FnHandler, HandlerFuture, JobContext, JobHandlerRegistry, ServerOptions, start_server};
use chrono::Utc;
use db::Storage;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Handler that logs each job and its invocation payload.
fn logging_handler(queue: &str, storage: Storage) -> impl actors::JobHandler {
    FnHandler::new(queue, move |job: &JobContext| -> HandlerFuture {
        let storage = storage.clone();
        let job = job.clone();
        Box::pin(async move {
            let stored = storage
                .jobs()
                .get_job(&job.job_id)
                .await
                .map_err(|e| e.to_string())?;
            match stored {
                Some(stored) => tracing::info!(
                    "Processing job {} from '{}': {}",
                    job.job_id,
                    job.queue,
                    stored.invocation
                ),
                None => tracing::info!("Processing job {} from '{}'", job.job_id, job.queue),
            }
            storage
                .jobs()
                .set_state(&job.job_id, "Succeeded", None)
                .await
                .or_else(|e| match e {
                    db::DbError::NotFound(_) => Ok(()),
                    other => Err(other.to_string()),
                })?;
            storage
                .jobs()
                .expire_job(&job.job_id, Duration::from_secs(24 * 60 * 60))
                .await
                .map_err(|e| e.to_string())
        })
    })
}

/// Put a few demo jobs on the first queue of an in-memory store.
async fn seed_demo_jobs(storage: &Storage, queue: &str) -> Result<(), db::DbError> {
    for n in 1..=3 {
        let invocation = serde_json::json!({ "demo": n }).to_string();
        let job_id = storage
            .jobs()
            .create_expired_job(&invocation, &[], Utc::now(), Duration::from_secs(60 * 60))
            .await?;
        storage.jobs().set_state(&job_id, "Enqueued", None).await?;
        storage.jobs().persist_job(&job_id).await?;
        storage.enqueue(queue, &job_id).await?;
    }
    tracing::info!("Seeded demo jobs on '{}'", queue);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Opening job storage at {}", config.db.endpoint);

    let seed = config.db.endpoint.starts_with("mem");
    let storage = Storage::open(config.db.clone(), config.storage.clone()).await?;

    let mut handlers = JobHandlerRegistry::new();
    for queue in &config.queues {
        handlers.register(logging_handler(queue, storage.clone()));
    }

    if seed && let Some(first) = config.queues.first() {
        seed_demo_jobs(&storage, first).await?;
    }

    let mut options = ServerOptions::default()
        .with_queues(config.queues.clone())
        .with_sweeper(config.sweeper);
    if let Some(workers) = config.workers {
        options = options.with_worker_count(workers);
    }

    let server = start_server(storage, handlers, options).await?;
    tracing::info!("Server {} running; press Ctrl-C to stop", server.server_id());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    server.shutdown().await?;

    Ok(())
}
