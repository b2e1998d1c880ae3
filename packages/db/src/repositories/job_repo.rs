//! Job, parameter and state records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{Clock, JobId, from_millis};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::expire_at;
use crate::{ConnectionGate, DbError};

/// Internal record type for SurrealDB.
#[derive(Debug, Deserialize)]
struct JobRecord {
    invocation: String,
    #[serde(default)]
    state_name: Option<String>,
    created_at: i64,
    #[serde(default)]
    expire_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ParameterRecord {
    #[serde(default)]
    param_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStateRecord {
    #[serde(default)]
    expire_at: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ParameterInput {
    name: String,
    value: String,
}

/// The job and its parameters commit together or not at all.
const CREATE_JOB: &str = r#"
BEGIN TRANSACTION;
CREATE type::thing('job', $id)
    SET invocation = $invocation, created_at = $created_at, expire_at = $expire_at;
FOR $param IN $parameters {
    CREATE type::thing('job_parameter', [$id, $param.name])
        SET job_id = $id, name = $param.name, param_value = $param.value, expire_at = $expire_at;
};
COMMIT TRANSACTION;
"#;

/// New parameter rows take the job's current expiry.
const UPSERT_PARAMETER: &str = r#"
LET $expire_at = (SELECT VALUE expire_at FROM type::thing('job', $job_id))[0];
UPSERT type::thing('job_parameter', [$job_id, $name])
    SET job_id = $job_id, name = $name, param_value = $value, expire_at = $expire_at;
"#;

/// A job as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub id: JobId,
    /// Serialized invocation payload, opaque to storage.
    pub invocation: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
}

impl JobRepository {
    pub fn new(gate: ConnectionGate, clock: Arc<dyn Clock>) -> Self {
        Self { gate, clock }
    }

    /// Create a job that expires `expire_in` after `created_at` unless it is
    /// persisted first. Parameters share the job's expiry.
    pub async fn create_expired_job(
        &self,
        invocation: &str,
        parameters: &[(&str, &str)],
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId, DbError> {
        let id = JobId::new();
        let created_at = created_at.timestamp_millis();
        let expires = expire_at(created_at, expire_in);

        let job_id = id.to_string();
        let invocation = invocation.to_string();
        let parameters: Vec<ParameterInput> = parameters
            .iter()
            .map(|(name, value)| ParameterInput {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();

        self.gate
            .with_connection(true, |db| async move {
                db.query(CREATE_JOB)
                    .bind(("id", job_id))
                    .bind(("invocation", invocation))
                    .bind(("created_at", created_at))
                    .bind(("expire_at", expires))
                    .bind(("parameters", parameters))
                    .await?
                    .check()?;
                Ok(())
            })
            .await?;

        tracing::debug!("Created job {}", id);
        Ok(id)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<StoredJob>, DbError> {
        let id = job_id.to_string();

        let record: Option<JobRecord> = self
            .gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(
                        "SELECT invocation, state_name, created_at, expire_at FROM type::thing('job', $id)",
                    )
                    .bind(("id", id))
                    .await?;
                let records: Vec<JobRecord> = response.take(0)?;
                Ok(records.into_iter().next())
            })
            .await?;

        Ok(record.map(|r| StoredJob {
            id: job_id.clone(),
            invocation: r.invocation,
            state_name: r.state_name,
            created_at: from_millis(r.created_at),
            expire_at: r.expire_at.map(from_millis),
        }))
    }

    /// Insert or overwrite one named parameter. The row expires with its job.
    pub async fn set_parameter(
        &self,
        job_id: &JobId,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), DbError> {
        if job_id.is_empty() {
            return Err(DbError::InvalidArgument("job id must not be empty".into()));
        }
        if name.trim().is_empty() {
            return Err(DbError::InvalidArgument("parameter name must not be empty".into()));
        }

        let job_id = job_id.to_string();
        let name = name.to_string();
        let value = value.map(str::to_string);

        self.gate
            .with_connection(true, |db| async move {
                db.query(UPSERT_PARAMETER)
                    .bind(("job_id", job_id))
                    .bind(("name", name))
                    .bind(("value", value))
                    .await?
                    .check()?;
                Ok(())
            })
            .await
    }

    pub async fn get_parameter(&self, job_id: &JobId, name: &str) -> Result<Option<String>, DbError> {
        let job_id = job_id.to_string();
        let name = name.to_string();

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query("SELECT param_value FROM type::thing('job_parameter', [$job_id, $name])")
                    .bind(("job_id", job_id))
                    .bind(("name", name))
                    .await?;
                let records: Vec<ParameterRecord> = response.take(0)?;
                Ok(records.into_iter().next().and_then(|r| r.param_value))
            })
            .await
    }

    /// Append a state to the job's history and make it current. The state
    /// row takes the job's current expiry.
    pub async fn set_state(
        &self,
        job_id: &JobId,
        name: &str,
        reason: Option<&str>,
    ) -> Result<(), DbError> {
        if name.trim().is_empty() {
            return Err(DbError::InvalidArgument("state name must not be empty".into()));
        }

        let state_id = Ulid::new().to_string();
        let id = job_id.to_string();
        let name = name.to_string();
        let reason = reason.map(str::to_string);
        let now = self.clock.now_millis();

        let updated = self
            .gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(
                        "UPDATE type::thing('job', $id) SET state_id = $state_id, state_name = $name RETURN AFTER",
                    )
                    .bind(("id", id.clone()))
                    .bind(("state_id", state_id.clone()))
                    .bind(("name", name.clone()))
                    .await?;
                let updated: Vec<JobStateRecord> = response.take(0)?;
                let Some(job) = updated.into_iter().next() else {
                    return Ok(false);
                };

                db.query(
                    "CREATE type::thing('state', $state_id) SET job_id = $id, name = $name, reason = $reason, created_at = $now, expire_at = $expire_at",
                )
                .bind(("state_id", state_id))
                .bind(("id", id))
                .bind(("name", name))
                .bind(("reason", reason))
                .bind(("now", now))
                .bind(("expire_at", job.expire_at))
                .await?
                .check()?;
                Ok(true)
            })
            .await?;

        if !updated {
            return Err(DbError::NotFound(format!("Job not found: {}", job_id)));
        }
        Ok(())
    }

    /// Give the job, its parameters and its states a time-to-live.
    pub async fn expire_job(&self, job_id: &JobId, ttl: Duration) -> Result<(), DbError> {
        let at = expire_at(self.clock.now_millis(), ttl);
        self.set_job_expiry(job_id, Some(at)).await
    }

    /// Clear the job's expiry so the sweeper keeps it.
    pub async fn persist_job(&self, job_id: &JobId) -> Result<(), DbError> {
        self.set_job_expiry(job_id, None).await
    }

    async fn set_job_expiry(&self, job_id: &JobId, at: Option<i64>) -> Result<(), DbError> {
        let id = job_id.to_string();

        self.gate
            .with_connection(true, |db| async move {
                db.query(
                    r#"
                    UPDATE type::thing('job', $id) SET expire_at = $at;
                    UPDATE job_parameter SET expire_at = $at WHERE job_id = $id;
                    UPDATE state SET expire_at = $at WHERE job_id = $id;
                    "#,
                )
                .bind(("id", id))
                .bind(("at", at))
                .await?
                .check()?;
                Ok(())
            })
            .await
    }
}
