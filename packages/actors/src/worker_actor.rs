//! Worker actor: claims entries and runs their handlers.

use std::sync::Arc;
use std::time::Duration;

use db::{DbError, FetchedJob, Storage};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio_util::sync::CancellationToken;

use crate::handler::{JobContext, JobHandlerRegistry};
use crate::messages::WorkerMessage;

/// State for the worker actor.
pub struct WorkerActorState {
    pub worker_id: String,
    /// Queues this worker draws from, in one dequeue call.
    pub queues: Vec<String>,
    pub storage: Storage,
    pub handlers: Arc<JobHandlerRegistry>,
    pub cancel: CancellationToken,
    /// Upper bound on one handler run.
    pub job_timeout: Option<Duration>,
    /// Pause after a failed attempt or a store error.
    pub retry_delay: Duration,
    /// Entries completed successfully.
    pub processed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub storage: Storage,
    pub handlers: Arc<JobHandlerRegistry>,
    pub cancel: CancellationToken,
    pub job_timeout: Option<Duration>,
    pub retry_delay: Duration,
}

enum Outcome {
    Succeeded,
    Failed,
}

/// Run the handler for `fetched`, then remove or requeue the entry.
async fn process(state: &WorkerActorState, fetched: FetchedJob) -> Outcome {
    let job = JobContext {
        entry_id: fetched.id(),
        job_id: fetched.job_id().clone(),
        queue: fetched.queue().to_string(),
    };

    let result = match state.handlers.get(&job.queue) {
        Some(handler) => match state.job_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handler.handle(&job))
                .await
                .unwrap_or_else(|_| Err("Job timed out".into())),
            None => handler.handle(&job).await,
        },
        None => Err(format!("No handler for queue: {}", job.queue)),
    };

    match result {
        Ok(()) => {
            if let Err(e) = fetched.remove_from_queue().await {
                tracing::warn!(
                    "[{}] Job {} finished but could not be removed: {}",
                    state.worker_id,
                    job.job_id,
                    e
                );
            }
            Outcome::Succeeded
        }
        Err(error) => {
            tracing::warn!("[{}] Job {} failed: {}", state.worker_id, job.job_id, error);
            if let Err(e) = fetched.requeue().await {
                tracing::warn!(
                    "[{}] Could not requeue job {}, it returns after its lease: {}",
                    state.worker_id,
                    job.job_id,
                    e
                );
            }
            Outcome::Failed
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker {} on queues [{}]",
            args.worker_id,
            args.queues.join(", ")
        );

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queues: args.queues,
            storage: args.storage,
            handlers: args.handlers,
            cancel: args.cancel,
            job_timeout: args.job_timeout,
            retry_delay: args.retry_delay,
            processed: 0,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(WorkerMessage::Fetch)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Fetch => {
                match state.storage.dequeue(&state.queues, &state.cancel).await {
                    Ok(fetched) => {
                        if let Outcome::Succeeded = process(state, fetched).await {
                            state.processed += 1;
                        } else if !pause(&state.cancel, state.retry_delay).await {
                            myself.stop(None);
                            return Ok(());
                        }
                    }
                    Err(DbError::Cancelled) => {
                        myself.stop(None);
                        return Ok(());
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!("[{}] Dequeue failed, retrying: {}", state.worker_id, e);
                        if !pause(&state.cancel, state.retry_delay).await {
                            myself.stop(None);
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::error!("[{}] Dequeue failed permanently: {}", state.worker_id, e);
                        myself.stop(Some(e.to_string()));
                        return Ok(());
                    }
                }

                myself.send_message(WorkerMessage::Fetch)?;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            "Worker {} stopped after {} jobs",
            state.worker_id,
            state.processed
        );
        Ok(())
    }
}
