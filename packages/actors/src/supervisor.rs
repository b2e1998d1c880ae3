//! Supervisor actor owning the workers and the expiration sweeper.

use std::sync::Arc;
use std::time::Duration;

use db::Storage;
use queue_core::normalize_queues;
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::handler::JobHandlerRegistry;
use crate::messages::{ActorError, ActorResult, SupervisorMessage, SweeperMessage, WorkerMessage};
use crate::sweeper_actor::{SweeperActor, SweeperArgs};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// How long shutdown waits for a child to finish its current job.
const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Processing server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Queues every worker draws from.
    pub queues: Vec<String>,
    pub worker_count: usize,
    pub job_timeout: Option<Duration>,
    /// Pause after a failed job or a store error.
    pub retry_delay: Duration,
    /// Whether this server runs the expiration sweeper.
    pub run_sweeper: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            queues: vec!["default".to_string()],
            worker_count: (cpus * 5).min(20),
            job_timeout: None,
            retry_delay: Duration::from_secs(1),
            run_sweeper: true,
        }
    }
}

impl ServerOptions {
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_sweeper(mut self, run_sweeper: bool) -> Self {
        self.run_sweeper = run_sweeper;
        self
    }
}

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub server_id: String,
    pub storage: Storage,
    pub handlers: Arc<JobHandlerRegistry>,
    pub options: ServerOptions,
    pub cancel: CancellationToken,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    pub server_id: String,
    pub workers: Vec<ActorRef<WorkerMessage>>,
    pub sweeper: Option<ActorRef<SweeperMessage>>,
    pub cancel: CancellationToken,
}

impl SupervisorState {
    fn children(&self) -> Vec<ActorCell> {
        self.workers
            .iter()
            .map(|w| w.get_cell())
            .chain(self.sweeper.iter().map(|s| s.get_cell()))
            .collect()
    }
}

/// Check the queue set and the handlers before anything is spawned.
fn validate(
    storage: &Storage,
    handlers: &JobHandlerRegistry,
    options: &ServerOptions,
) -> ActorResult<Vec<String>> {
    let queues = normalize_queues(&options.queues).ok_or_else(|| {
        ActorError::Configuration("at least one non-empty queue name is required".into())
    })?;
    if options.worker_count == 0 {
        return Err(ActorError::Configuration("worker_count must be at least 1".into()));
    }
    if let Some(missing) = queues.iter().find(|q| !handlers.has_handler(q)) {
        return Err(ActorError::Configuration(format!(
            "no handler registered for queue '{}'",
            missing
        )));
    }
    storage.queue_providers().resolve(&queues)?;
    Ok(queues)
}

/// Supervisor actor that manages the server's children.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting processing server {}", args.server_id);

        let queues = validate(&args.storage, &args.handlers, &args.options)?;

        let mut workers = Vec::with_capacity(args.options.worker_count);
        for n in 1..=args.options.worker_count {
            let worker_id = format!("{}:worker-{}", args.server_id, n);
            let worker_args = WorkerArgs {
                worker_id: worker_id.clone(),
                queues: queues.clone(),
                storage: args.storage.clone(),
                handlers: args.handlers.clone(),
                cancel: args.cancel.clone(),
                job_timeout: args.options.job_timeout,
                retry_delay: args.options.retry_delay,
            };
            let (worker, _handle) =
                Actor::spawn_linked(Some(worker_id), WorkerActor, worker_args, myself.get_cell())
                    .await
                    .map_err(|e| ActorError::Spawn(e.to_string()))?;
            workers.push(worker);
        }

        let sweeper = if args.options.run_sweeper {
            let sweeper_args = SweeperArgs {
                sweeper: args.storage.expiration_sweeper(),
                cancel: args.cancel.clone(),
            };
            let (sweeper, _handle) = Actor::spawn_linked(
                Some(format!("{}:sweeper", args.server_id)),
                SweeperActor,
                sweeper_args,
                myself.get_cell(),
            )
            .await
            .map_err(|e| ActorError::Spawn(e.to_string()))?;
            Some(sweeper)
        } else {
            None
        };

        Ok(SupervisorState {
            server_id: args.server_id,
            workers,
            sweeper,
            cancel: args.cancel,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::WorkerCount { reply } => {
                let _ = reply.send(state.workers.len());
            }

            SupervisorMessage::SweeperRunning { reply } => {
                let _ = reply.send(state.sweeper.is_some());
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down processing server {}", state.server_id);
                state.cancel.cancel();
                for child in state.children() {
                    if let Err(e) = child
                        .stop_and_wait(Some("shutdown".into()), Some(CHILD_STOP_TIMEOUT))
                        .await
                    {
                        tracing::warn!("Child {:?} did not stop cleanly: {}", child.get_name(), e);
                    }
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                match reason {
                    Some(reason) if reason != "shutdown" => tracing::warn!(
                        "Child {} stopped: {}",
                        cell.get_name().unwrap_or_default(),
                        reason
                    ),
                    _ => tracing::debug!("Child {} stopped", cell.get_name().unwrap_or_default()),
                }
                forget_child(state, &cell);
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                tracing::error!(
                    "Child {} failed: {}",
                    cell.get_name().unwrap_or_default(),
                    error
                );
                forget_child(state, &cell);
            }
            _ => {}
        }
        Ok(())
    }
}

fn forget_child(state: &mut SupervisorState, cell: &ActorCell) {
    state.workers.retain(|w| w.get_id() != cell.get_id());
    if state
        .sweeper
        .as_ref()
        .is_some_and(|s| s.get_id() == cell.get_id())
    {
        state.sweeper = None;
    }
}

/// A running processing server.
pub struct ServerHandle {
    server_id: String,
    supervisor: ActorRef<SupervisorMessage>,
    join: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl ServerHandle {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn supervisor(&self) -> &ActorRef<SupervisorMessage> {
        &self.supervisor
    }

    /// Token cancelled when the server shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn worker_count(&self) -> ActorResult<usize> {
        let result = ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::WorkerCount { reply },
            Some(Duration::from_secs(5)),
        )
        .await;
        match result {
            Ok(ractor::rpc::CallResult::Success(count)) => Ok(count),
            Ok(ractor::rpc::CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(ractor::rpc::CallResult::SenderError) => {
                Err(ActorError::Actor("supervisor dropped the reply".into()))
            }
            Err(e) => Err(ActorError::Actor(e.to_string())),
        }
    }

    pub async fn sweeper_running(&self) -> ActorResult<bool> {
        let result = ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::SweeperRunning { reply },
            Some(Duration::from_secs(5)),
        )
        .await;
        match result {
            Ok(ractor::rpc::CallResult::Success(running)) => Ok(running),
            Ok(ractor::rpc::CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(ractor::rpc::CallResult::SenderError) => {
                Err(ActorError::Actor("supervisor dropped the reply".into()))
            }
            Err(e) => Err(ActorError::Actor(e.to_string())),
        }
    }

    /// Cancel waiting workers, let running jobs finish and stop everything.
    pub async fn shutdown(self) -> ActorResult<()> {
        self.cancel.cancel();
        if self.supervisor.send_message(SupervisorMessage::Shutdown).is_err() {
            tracing::debug!("Supervisor {} already stopped", self.server_id);
        }
        self.join
            .await
            .map_err(|e| ActorError::Actor(e.to_string()))
    }
}

/// Start a processing server: `options.worker_count` workers draining
/// `options.queues`, plus the expiration sweeper when enabled.
pub async fn start_server(
    storage: Storage,
    handlers: JobHandlerRegistry,
    options: ServerOptions,
) -> ActorResult<ServerHandle> {
    let server_id = format!("server-{}", Ulid::new().to_string().to_lowercase());
    let cancel = CancellationToken::new();

    let args = SupervisorArgs {
        server_id: server_id.clone(),
        storage,
        handlers: Arc::new(handlers),
        options,
        cancel: cancel.clone(),
    };

    let (supervisor, join) =
        Actor::spawn(Some(format!("{}:supervisor", server_id)), Supervisor, args)
            .await
            .map_err(|e| ActorError::Spawn(e.to_string()))?;

    Ok(ServerHandle {
        server_id,
        supervisor,
        join,
        cancel,
    })
}
