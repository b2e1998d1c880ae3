//! Pluggable queue backends and the mapping from queue names to them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use queue_core::{EntryId, JobId, normalize_queues};
use tokio_util::sync::CancellationToken;

use crate::DbError;
use crate::repositories::{FetchedJob, SurrealJobQueue};

/// Future returned by queue backends.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// A queue backend.
///
/// Implement this to serve some queues from a store other than the default
/// `job_queue` table.
pub trait PersistentJobQueue: Send + Sync + 'static {
    fn enqueue<'a>(&'a self, queue: &'a str, job_id: &'a JobId) -> QueueFuture<'a, EntryId>;

    fn dequeue<'a>(
        &'a self,
        queues: &'a [String],
        cancel: &'a CancellationToken,
    ) -> QueueFuture<'a, FetchedJob>;
}

impl PersistentJobQueue for SurrealJobQueue {
    fn enqueue<'a>(&'a self, queue: &'a str, job_id: &'a JobId) -> QueueFuture<'a, EntryId> {
        Box::pin(SurrealJobQueue::enqueue(self, queue, job_id))
    }

    fn dequeue<'a>(
        &'a self,
        queues: &'a [String],
        cancel: &'a CancellationToken,
    ) -> QueueFuture<'a, FetchedJob> {
        Box::pin(SurrealJobQueue::dequeue(self, queues, cancel))
    }
}

/// Maps queue names to backends. Unregistered names use the default.
#[derive(Clone)]
pub struct QueueProviders {
    default: Arc<dyn PersistentJobQueue>,
    by_queue: HashMap<String, Arc<dyn PersistentJobQueue>>,
}

fn same_provider(a: &Arc<dyn PersistentJobQueue>, b: &Arc<dyn PersistentJobQueue>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl QueueProviders {
    pub fn new(default: Arc<dyn PersistentJobQueue>) -> Self {
        Self {
            default,
            by_queue: HashMap::new(),
        }
    }

    /// Serve `queues` from `provider`.
    ///
    /// Fails if one of the names is already served by a different provider.
    pub fn register<I, S>(
        &mut self,
        queues: I,
        provider: Arc<dyn PersistentJobQueue>,
    ) -> Result<(), DbError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let queues = normalize_queues(queues).ok_or_else(|| {
            DbError::InvalidArgument("at least one non-empty queue name is required".into())
        })?;

        if let Some(taken) = queues.iter().find(|queue| {
            self.by_queue
                .get(queue.as_str())
                .is_some_and(|existing| !same_provider(existing, &provider))
        }) {
            return Err(DbError::Configuration(format!(
                "queue '{}' is already served by another provider",
                taken
            )));
        }

        for queue in queues {
            self.by_queue.insert(queue, provider.clone());
        }
        Ok(())
    }

    pub fn provider_for(&self, queue: &str) -> Arc<dyn PersistentJobQueue> {
        self.by_queue
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// The single provider serving every name in `queues`.
    pub fn resolve(&self, queues: &[String]) -> Result<Arc<dyn PersistentJobQueue>, DbError> {
        let queues = normalize_queues(queues).ok_or_else(|| {
            DbError::InvalidArgument("at least one non-empty queue name is required".into())
        })?;

        let mut providers = queues.iter().map(|queue| self.provider_for(queue));
        let Some(first) = providers.next() else {
            return Err(DbError::InvalidArgument(
                "at least one non-empty queue name is required".into(),
            ));
        };

        if providers.any(|other| !same_provider(&first, &other)) {
            return Err(DbError::Configuration(format!(
                "queues [{}] are served by more than one provider; dequeue them separately",
                queues.join(", ")
            )));
        }

        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverQueue;

    impl PersistentJobQueue for NeverQueue {
        fn enqueue<'a>(&'a self, _queue: &'a str, _job_id: &'a JobId) -> QueueFuture<'a, EntryId> {
            Box::pin(async { Ok(EntryId(0)) })
        }

        fn dequeue<'a>(
            &'a self,
            _queues: &'a [String],
            _cancel: &'a CancellationToken,
        ) -> QueueFuture<'a, FetchedJob> {
            Box::pin(async { Err(DbError::Cancelled) })
        }
    }

    fn names(queues: &[&str]) -> Vec<String> {
        queues.iter().map(|q| q.to_string()).collect()
    }

    #[test]
    fn unregistered_queues_use_the_default() {
        let default: Arc<dyn PersistentJobQueue> = Arc::new(NeverQueue);
        let providers = QueueProviders::new(default.clone());

        let resolved = providers.resolve(&names(&["default", "critical"])).ok();
        assert!(resolved.is_some_and(|p| same_provider(&p, &default)));
    }

    #[test]
    fn mixed_providers_are_a_configuration_error() {
        let mut providers = QueueProviders::new(Arc::new(NeverQueue));
        let other: Arc<dyn PersistentJobQueue> = Arc::new(NeverQueue);
        assert!(providers.register(["external"], other.clone()).is_ok());

        assert!(matches!(
            providers.resolve(&names(&["default", "external"])),
            Err(DbError::Configuration(_))
        ));
        let resolved = providers.resolve(&names(&["external"])).ok();
        assert!(resolved.is_some_and(|p| same_provider(&p, &other)));
    }

    #[test]
    fn reregistering_a_queue_elsewhere_fails() {
        let mut providers = QueueProviders::new(Arc::new(NeverQueue));
        let first: Arc<dyn PersistentJobQueue> = Arc::new(NeverQueue);
        let second: Arc<dyn PersistentJobQueue> = Arc::new(NeverQueue);

        assert!(providers.register(["reports"], first.clone()).is_ok());
        assert!(providers.register(["reports", "emails"], first).is_ok());
        assert!(matches!(
            providers.register(["emails"], second),
            Err(DbError::Configuration(_))
        ));
    }

    #[test]
    fn empty_queue_sets_are_rejected() {
        let providers = QueueProviders::new(Arc::new(NeverQueue));
        assert!(matches!(providers.resolve(&[]), Err(DbError::InvalidArgument(_))));
        assert!(matches!(
            providers.resolve(&names(&[" "])),
            Err(DbError::InvalidArgument(_))
        ));
    }
}
