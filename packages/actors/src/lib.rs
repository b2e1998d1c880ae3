//! Actor system for processing queued jobs.
//!
//! This crate provides the Ractor-based processing server that drains
//! queues from a [`db::Storage`].
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that owns the workers and the sweeper
//! - `WorkerActor` - Claims entries, runs their handler, removes or requeues them
//! - `SweeperActor` - Runs the expiration sweeper on its check interval
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, ServerOptions, job_handler, start_server};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(job_handler!("default", |job| {
//!     tracing::info!("processing {}", job.job_id);
//!     Ok(())
//! }));
//!
//! let server = start_server(storage, handlers, ServerOptions::default()).await?;
//! // ...
//! server.shutdown().await?;
//! ```

mod handler;
mod messages;
mod supervisor;
mod sweeper_actor;
mod worker_actor;

pub use handler::{FnHandler, HandlerFuture, HandlerResult, JobContext, JobHandler, JobHandlerRegistry};
pub use messages::{ActorError, ActorResult, SupervisorMessage, SweeperMessage, WorkerMessage};
pub use supervisor::{ServerHandle, ServerOptions, Supervisor, start_server};
pub use sweeper_actor::SweeperActor;
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
