//! Read-only queue statistics.

use queue_core::JobId;
use serde::Deserialize;

use crate::{ConnectionGate, DbError};

/// Entries waiting in a queue and entries currently claimed from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub enqueued: usize,
    pub fetched: usize,
}

#[derive(Debug, Deserialize)]
struct CountRecord {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct QueueNameRecord {
    queue: String,
}

#[derive(Debug, Deserialize)]
struct JobIdRecord {
    job_id: String,
}

#[derive(Clone)]
pub struct QueueMonitoring {
    gate: ConnectionGate,
}

impl QueueMonitoring {
    pub fn new(gate: ConnectionGate) -> Self {
        Self { gate }
    }

    /// Distinct queue names that currently hold entries, sorted.
    pub async fn queues(&self) -> Result<Vec<String>, DbError> {
        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query("SELECT queue FROM job_queue GROUP BY queue ORDER BY queue ASC")
                    .await?;
                let records: Vec<QueueNameRecord> = response.take(0)?;
                Ok(records.into_iter().map(|r| r.queue).collect())
            })
            .await
    }

    pub async fn enqueued_and_fetched_count(&self, queue: &str) -> Result<QueueCounts, DbError> {
        let queue = queue.to_string();

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(
                        r#"
                        SELECT count() AS count FROM job_queue WHERE queue = $queue AND fetched_at = NONE GROUP ALL;
                        SELECT count() AS count FROM job_queue WHERE queue = $queue AND fetched_at != NONE GROUP ALL;
                        "#,
                    )
                    .bind(("queue", queue))
                    .await?;
                let enqueued: Vec<CountRecord> = response.take(0)?;
                let fetched: Vec<CountRecord> = response.take(1)?;
                Ok(QueueCounts {
                    enqueued: enqueued.first().map_or(0, |r| r.count),
                    fetched: fetched.first().map_or(0, |r| r.count),
                })
            })
            .await
    }

    /// Page of unclaimed job ids, oldest first.
    pub async fn enqueued_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, DbError> {
        self.page(queue, false, from, per_page).await
    }

    /// Page of claimed job ids, oldest first.
    pub async fn fetched_job_ids(
        &self,
        queue: &str,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, DbError> {
        self.page(queue, true, from, per_page).await
    }

    async fn page(
        &self,
        queue: &str,
        fetched: bool,
        from: usize,
        per_page: usize,
    ) -> Result<Vec<JobId>, DbError> {
        let query = if fetched {
            "SELECT seq, job_id FROM job_queue WHERE queue = $queue AND fetched_at != NONE ORDER BY seq ASC LIMIT $limit START $start"
        } else {
            "SELECT seq, job_id FROM job_queue WHERE queue = $queue AND fetched_at = NONE ORDER BY seq ASC LIMIT $limit START $start"
        };
        let queue = queue.to_string();
        let limit = per_page as i64;
        let start = from as i64;

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(query)
                    .bind(("queue", queue))
                    .bind(("limit", limit))
                    .bind(("start", start))
                    .await?;
                let records: Vec<JobIdRecord> = response.take(0)?;
                Ok(records.into_iter().map(|r| JobId(r.job_id)).collect())
            })
            .await
    }
}
