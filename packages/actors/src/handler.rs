//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use queue_core::{EntryId, JobId};

/// Result type for job handlers.
pub type HandlerResult = Result<(), String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// The claimed entry handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub queue: String,
}

/// Trait for job handlers.
///
/// A handler owns one queue. Returning `Err` puts the entry back on the
/// queue for another attempt.
pub trait JobHandler: Send + Sync + 'static {
    /// The queue this handler processes.
    fn queue(&self) -> &str;

    fn handle(&self, job: &JobContext) -> HandlerFuture;
}

/// Maps queue names to their handlers.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same queue.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let queue = handler.queue().to_string();
        self.handlers.insert(queue, Arc::new(handler));
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn has_handler(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        queues.sort_unstable();
        queues
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(&JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    queue: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(queue: impl Into<String>, handler: F) -> Self {
        Self {
            queue: queue.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    fn handle(&self, job: &JobContext) -> HandlerFuture {
        (self.handler)(job)
    }
}

/// Helper macro for creating job handlers from async closures.
#[macro_export]
macro_rules! job_handler {
    ($queue:expr, |$job:ident| $body:expr) => {
        $crate::FnHandler::new($queue, |$job: &$crate::JobContext| -> $crate::HandlerFuture {
            let $job = $job.clone();
            Box::pin(async move { $body })
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(queue: &str) -> JobContext {
        JobContext {
            entry_id: EntryId(1),
            job_id: JobId::from("job-1"),
            queue: queue.to_string(),
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_queue() {
        let mut registry = JobHandlerRegistry::new();
        registry.register(FnHandler::new("default", |_job: &JobContext| {
            Box::pin(async { Ok(()) }) as HandlerFuture
        }));
        registry.register(crate::job_handler!("critical", |job| {
            Err(format!("{} failed", job.job_id))
        }));

        assert_eq!(registry.queues(), vec!["critical", "default"]);
        assert!(!registry.has_handler("missing"));

        let ok = match registry.get("default") {
            Some(handler) => handler.handle(&context("default")).await,
            None => Err("no handler".into()),
        };
        assert_eq!(ok, Ok(()));

        let failed = match registry.get("critical") {
            Some(handler) => handler.handle(&context("critical")).await,
            None => Ok(()),
        };
        assert_eq!(failed, Err("job-1 failed".to_string()));
    }
}
