//! Server configuration read from the environment.

use std::collections::HashMap;

use db::DbConfig;
use queue_core::StorageOptions;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("JOBSTORE_OPTIONS is not valid storage options JSON: {0}")]
    InvalidOptions(#[from] serde_json::Error),
    #[error("JOBSTORE_QUEUES must name at least one queue")]
    NoQueues,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub storage: StorageOptions,
    pub queues: Vec<String>,
    pub workers: Option<usize>,
    pub sweeper: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from a variable map.
    ///
    /// `JOBSTORE_ENDPOINT` (default `mem://`), `JOBSTORE_NAMESPACE`,
    /// `JOBSTORE_DATABASE`, `JOBSTORE_USER`/`JOBSTORE_PASS`,
    /// `JOBSTORE_QUEUES` (comma separated, default `default`),
    /// `JOBSTORE_WORKERS`, `JOBSTORE_SWEEPER` (`false` disables it) and
    /// `JOBSTORE_OPTIONS` (storage options as JSON).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut db = DbConfig::default();
        if let Some(endpoint) = vars.get("JOBSTORE_ENDPOINT") {
            db.endpoint = endpoint.clone();
        }
        if let Some(namespace) = vars.get("JOBSTORE_NAMESPACE") {
            db = db.with_namespace(namespace.as_str());
        }
        if let Some(database) = vars.get("JOBSTORE_DATABASE") {
            db = db.with_database(database.as_str());
        }
        if let (Some(user), Some(pass)) = (vars.get("JOBSTORE_USER"), vars.get("JOBSTORE_PASS")) {
            db = db.with_credentials(user.as_str(), pass.as_str());
        }

        let storage = match vars.get("JOBSTORE_OPTIONS") {
            Some(json) => serde_json::from_str(json)?,
            None => StorageOptions::default(),
        };

        let queues: Vec<String> = vars
            .get("JOBSTORE_QUEUES")
            .map(String::as_str)
            .unwrap_or("default")
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
        if queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let workers = match vars.get("JOBSTORE_WORKERS") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "JOBSTORE_WORKERS",
                        value: value.clone(),
                    });
                }
            },
            None => None,
        };

        let sweeper = vars
            .get("JOBSTORE_SWEEPER")
            .is_none_or(|v| !v.eq_ignore_ascii_case("false"));

        Ok(Self {
            db,
            storage,
            queues,
            workers,
            sweeper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_to_an_in_memory_store() {
        let config = ServerConfig::from_vars(HashMap::new()).unwrap();
        assert!(config.db.is_embedded());
        assert_eq!(config.queues, vec!["default"]);
        assert_eq!(config.workers, None);
        assert!(config.sweeper);
    }

    #[test]
    fn reads_queues_workers_and_options() {
        let config = ServerConfig::from_vars(vars(&[
            ("JOBSTORE_ENDPOINT", "ws://db:8000"),
            ("JOBSTORE_QUEUES", "critical, default,"),
            ("JOBSTORE_WORKERS", "8"),
            ("JOBSTORE_SWEEPER", "false"),
            ("JOBSTORE_OPTIONS", r#"{"invisibility_timeout_secs": 600}"#),
        ]))
        .unwrap();

        assert!(!config.db.is_embedded());
        assert_eq!(config.queues, vec!["critical", "default"]);
        assert_eq!(config.workers, Some(8));
        assert!(!config.sweeper);
        assert_eq!(config.storage.invisibility_timeout_secs, 600);
        assert_eq!(config.storage.queue_poll_interval_ms, 15_000);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_vars(vars(&[("JOBSTORE_WORKERS", "zero")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            ServerConfig::from_vars(vars(&[("JOBSTORE_QUEUES", " , ")])),
            Err(ConfigError::NoQueues)
        ));
        assert!(matches!(
            ServerConfig::from_vars(vars(&[("JOBSTORE_OPTIONS", "{")])),
            Err(ConfigError::InvalidOptions(_))
        ));
    }
}
