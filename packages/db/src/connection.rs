//! Connection gate: brokers access to the database handle and serializes writers.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use queue_core::OptionsError;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Upper bound on how long one writer may stall another.
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoint schemes whose datastore lives inside the handle itself.
const EMBEDDED_SCHEMES: &[&str] = &["mem://", "memory", "file://", "rocksdb://", "surrealkv://"];

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "rocksdb://path", "ws://host:port", ...
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobstore".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for a shared database server (requires remote feature).
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Identity of the backing store; writers are serialized per identity.
    pub fn identity(&self) -> String {
        format!("{}/{}/{}", self.endpoint, self.namespace, self.database)
    }

    /// Whether the datastore is owned by the handle, so it cannot be reopened
    /// per operation without losing (or locking out) its data.
    pub fn is_embedded(&self) -> bool {
        EMBEDDED_SCHEMES
            .iter()
            .any(|scheme| self.endpoint.starts_with(scheme))
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Timed out after {timeout:?} waiting for the write lock on {store}")]
    LockTimeout { store: String, timeout: Duration },
    #[error("Timed out after {timeout:?} waiting for distributed lock '{resource}'")]
    DistributedLockTimeout { resource: String, timeout: Duration },
    #[error("Distributed lock '{resource}' unavailable: {reason}")]
    DistributedLockUnavailable { resource: String, reason: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid options: {0}")]
    Options(#[from] OptionsError),
}

impl DbError {
    /// Failures worth retrying on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::LockTimeout { .. }
                | DbError::DistributedLockTimeout { .. }
                | DbError::DistributedLockUnavailable { .. }
                | DbError::Connection(_)
        )
    }
}

/// Open a handle and select the configured namespace and database.
pub async fn open(config: &DbConfig) -> Result<Database, DbError> {
    tracing::debug!("Connecting to database: {}", config.endpoint);

    let db = connect(&config.endpoint).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace).use_db(&config.database).await?;

    Ok(db)
}

/// In-process write-exclusive section for one backing store.
///
/// Construct one per store identity and share it (via `Arc`) with every
/// gate that talks to that store.
#[derive(Debug)]
pub struct WriteSection {
    identity: String,
    lock: Arc<Mutex<()>>,
    timeout: Duration,
}

impl WriteSection {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lock: Arc::new(Mutex::new(())),
            timeout: WRITE_LOCK_TIMEOUT,
        }
    }

    /// Override the acquisition bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Enter the section, failing with `LockTimeout` once the bound elapses.
    pub async fn enter(&self) -> Result<OwnedMutexGuard<()>, DbError> {
        tokio::time::timeout(self.timeout, self.lock.clone().lock_owned())
            .await
            .map_err(|_| DbError::LockTimeout {
                store: self.identity.clone(),
                timeout: self.timeout,
            })
    }
}

/// A handle borrowed from the gate for one operation.
///
/// Dropping it leaves the write section (if held) and closes the handle if
/// the gate opened it for this operation.
pub struct ConnectionLease {
    db: Database,
    owned: bool,
    write: Option<OwnedMutexGuard<()>>,
}

impl ConnectionLease {
    pub fn holds_write_section(&self) -> bool {
        self.write.is_some()
    }
}

impl Deref for ConnectionLease {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.owned {
            tracing::trace!("Closing per-operation database handle");
        }
    }
}

/// Brokers every storage access.
#[derive(Clone)]
pub struct ConnectionGate {
    config: Arc<DbConfig>,
    shared: Option<Database>,
    section: Arc<WriteSection>,
}

impl ConnectionGate {
    /// Gate that opens a fresh handle for each operation.
    pub fn per_operation(config: DbConfig, section: Arc<WriteSection>) -> Self {
        Self {
            config: Arc::new(config),
            shared: None,
            section,
        }
    }

    /// Gate around a long-lived handle. The gate never closes it.
    pub fn with_handle(config: DbConfig, db: Database, section: Arc<WriteSection>) -> Self {
        Self {
            config: Arc::new(config),
            shared: Some(db),
            section,
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn write_section(&self) -> &Arc<WriteSection> {
        &self.section
    }

    /// Acquire a handle, entering the write section first when `write_intent`.
    pub async fn acquire(&self, write_intent: bool) -> Result<ConnectionLease, DbError> {
        let write = if write_intent {
            Some(self.section.enter().await?)
        } else {
            None
        };

        let (db, owned) = match &self.shared {
            Some(db) => (db.clone(), false),
            None => (open(&self.config).await?, true),
        };

        Ok(ConnectionLease {
            db,
            owned,
            write,
        })
    }

    /// Run `body` against a handle; the handle and the write section are
    /// released however `body` finishes.
    pub async fn with_connection<T, F, Fut>(&self, write_intent: bool, body: F) -> Result<T, DbError>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let lease = self.acquire(write_intent).await?;
        body(lease.db.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_operation_gate_opens_and_releases_its_own_handle() {
        let section = Arc::new(
            WriteSection::new("mem://").with_timeout(Duration::from_millis(50)),
        );
        let gate = ConnectionGate::per_operation(DbConfig::memory(), section.clone());

        let lease = gate.acquire(true).await.expect("acquire write lease");
        assert!(lease.owned);
        assert!(lease.holds_write_section());
        lease.query("RETURN 1").await.expect("query on owned handle");
        assert!(section.lock.try_lock().is_err());

        drop(lease);
        assert!(section.lock.try_lock().is_ok());

        let reader = gate.acquire(false).await.expect("acquire read lease");
        assert!(reader.owned);
        assert!(!reader.holds_write_section());
    }
}
