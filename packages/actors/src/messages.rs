//! Message types for actor communication.

use db::DbError;
use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Claim the next entry from the worker's queues and process it.
    Fetch,
}

/// Messages for the SweeperActor.
#[derive(Debug)]
pub enum SweeperMessage {
    /// Run one expiration pass.
    Sweep,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Number of workers still running.
    WorkerCount { reply: RpcReplyPort<usize> },

    /// Whether the expiration sweeper is running.
    SweeperRunning { reply: RpcReplyPort<bool> },

    /// Cancel in-flight waits and stop every child.
    Shutdown,
}

/// Result type for server operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Timeout")]
    Timeout,
}
