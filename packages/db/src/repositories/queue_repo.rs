//! Lease-based job queue over the `job_queue` table.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    Clock, EntryId, JobId, QueueEntry, StorageOptions, from_millis, millis_before,
    normalize_queues,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::next_sequence;
use crate::{ConnectionGate, DbError};

/// Oldest eligible entry among the requested queues.
const SELECT_ELIGIBLE: &str = r#"
SELECT seq, job_id, queue, fetched_at FROM job_queue
WHERE queue IN $queues AND (fetched_at = NONE OR fetched_at <= $boundary)
ORDER BY seq ASC
LIMIT 1
"#;

/// Claim an entry only if it is still eligible; another process may have
/// claimed it between the select and this update.
const CLAIM_ENTRY: &str = r#"
UPDATE type::thing('job_queue', $seq)
SET fetched_at = $now
WHERE fetched_at = NONE OR fetched_at <= $boundary
RETURN AFTER
"#;

/// Internal record type for SurrealDB reads.
#[derive(Debug, Deserialize)]
struct QueueRecord {
    seq: i64,
    job_id: String,
    queue: String,
    #[serde(default)]
    fetched_at: Option<i64>,
}

impl QueueRecord {
    fn into_entry(self) -> QueueEntry {
        QueueEntry {
            id: EntryId(self.seq),
            job_id: JobId(self.job_id),
            queue: self.queue,
            fetched_at: self.fetched_at.map(from_millis),
        }
    }
}

/// Job queue backed by the `job_queue` table.
#[derive(Clone)]
pub struct SurrealJobQueue {
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    invisibility_timeout: Duration,
}

impl SurrealJobQueue {
    pub fn new(gate: ConnectionGate, clock: Arc<dyn Clock>, options: &StorageOptions) -> Self {
        Self {
            gate,
            clock,
            poll_interval: options.queue_poll_interval(),
            invisibility_timeout: options.invisibility_timeout(),
        }
    }

    /// Insert an unclaimed entry. Repeated calls insert duplicates.
    pub async fn enqueue(&self, queue: &str, job_id: &JobId) -> Result<EntryId, DbError> {
        let queue = queue.trim();
        if queue.is_empty() {
            return Err(DbError::InvalidArgument("queue name must not be empty".into()));
        }
        if job_id.is_empty() {
            return Err(DbError::InvalidArgument("job id must not be empty".into()));
        }

        let queue = queue.to_string();
        let job_id = job_id.to_string();

        let id = self
            .gate
            .with_connection(true, |db| async move {
                let seq = next_sequence(&db, "job_queue").await?;
                db.query(
                    "CREATE type::thing('job_queue', $seq) SET seq = $seq, job_id = $job_id, queue = $queue",
                )
                .bind(("seq", seq))
                .bind(("job_id", job_id))
                .bind(("queue", queue))
                .await?
                .check()?;
                Ok(EntryId(seq))
            })
            .await?;

        tracing::debug!("Enqueued entry {}", id);
        Ok(id)
    }

    /// Block until an entry from `queues` is claimed or `cancel` fires.
    ///
    /// Entries are handed out oldest first across the whole queue set. An
    /// entry whose claim is older than the invisibility timeout is handed out
    /// again.
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DbError> {
        let queues = normalize_queues(queues).ok_or_else(|| {
            DbError::InvalidArgument("at least one non-empty queue name is required".into())
        })?;

        loop {
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }

            if let Some(entry) = self.try_claim(&queues).await? {
                tracing::debug!(
                    "Fetched entry {} (job {}) from queue '{}'",
                    entry.id,
                    entry.job_id,
                    entry.queue
                );
                return Ok(FetchedJob::new(self.gate.clone(), entry));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DbError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One write-intent section: find the oldest eligible entry and claim it.
    async fn try_claim(&self, queues: &[String]) -> Result<Option<QueueEntry>, DbError> {
        let queues = queues.to_vec();
        let clock = self.clock.clone();
        let lease = self.invisibility_timeout;

        self.gate
            .with_connection(true, |db| async move {
                loop {
                    let now = clock.now_millis();
                    let boundary = millis_before(now, lease);

                    let mut response = db
                        .query(SELECT_ELIGIBLE)
                        .bind(("queues", queues.clone()))
                        .bind(("boundary", boundary))
                        .await?;
                    let candidates: Vec<QueueRecord> = response.take(0)?;

                    let Some(candidate) = candidates.into_iter().next() else {
                        return Ok(None);
                    };

                    let mut response = db
                        .query(CLAIM_ENTRY)
                        .bind(("seq", candidate.seq))
                        .bind(("now", now))
                        .bind(("boundary", boundary))
                        .await?;
                    let claimed: Vec<QueueRecord> = response.take(0)?;

                    match claimed.into_iter().next() {
                        Some(record) => return Ok(Some(record.into_entry())),
                        None => {
                            tracing::debug!(
                                "Entry {} was claimed concurrently, looking for another",
                                candidate.seq
                            );
                        }
                    }
                }
            })
            .await
    }
}

/// A claimed queue entry.
///
/// The entry stays in the table until the holder calls
/// [`FetchedJob::remove_from_queue`] or [`FetchedJob::requeue`]; dropping the
/// handle does neither, and the claim simply lapses after the lease.
pub struct FetchedJob {
    gate: ConnectionGate,
    entry: QueueEntry,
}

impl FetchedJob {
    pub fn new(gate: ConnectionGate, entry: QueueEntry) -> Self {
        Self { gate, entry }
    }

    pub fn id(&self) -> EntryId {
        self.entry.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.entry.job_id
    }

    pub fn queue(&self) -> &str {
        &self.entry.queue
    }

    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    fn claimed_at(&self) -> Option<i64> {
        self.entry.fetched_at.map(|t| t.timestamp_millis())
    }

    /// Delete the entry; the job has left the queued state.
    ///
    /// Does nothing if the lease already lapsed and another worker holds a
    /// newer claim.
    pub async fn remove_from_queue(&self) -> Result<(), DbError> {
        let seq = self.entry.id.0;
        let fetched_at = self.claimed_at();

        let removed = self
            .gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(
                        "DELETE type::thing('job_queue', $seq) WHERE fetched_at = $fetched_at RETURN BEFORE",
                    )
                    .bind(("seq", seq))
                    .bind(("fetched_at", fetched_at))
                    .await?;
                let deleted: Vec<QueueRecord> = response.take(0)?;
                Ok(!deleted.is_empty())
            })
            .await?;

        if removed {
            tracing::debug!("Removed entry {} from queue '{}'", seq, self.entry.queue);
        } else {
            tracing::warn!(
                "Entry {} was not removed: it was already removed or re-claimed by another worker",
                seq
            );
        }
        Ok(())
    }

    /// Clear the claim so the entry is immediately fetchable again.
    ///
    /// Does nothing if the lease already lapsed and another worker holds a
    /// newer claim.
    pub async fn requeue(&self) -> Result<(), DbError> {
        let seq = self.entry.id.0;
        let fetched_at = self.claimed_at();

        let released = self
            .gate
            .with_connection(true, |db| async move {
                let mut response = db
                    .query(
                        "UPDATE type::thing('job_queue', $seq) SET fetched_at = NONE WHERE fetched_at = $fetched_at RETURN AFTER",
                    )
                    .bind(("seq", seq))
                    .bind(("fetched_at", fetched_at))
                    .await?;
                let updated: Vec<QueueRecord> = response.take(0)?;
                Ok(!updated.is_empty())
            })
            .await?;

        if released {
            tracing::debug!("Requeued entry {} on queue '{}'", seq, self.entry.queue);
        } else {
            tracing::warn!(
                "Entry {} was not requeued: it was removed or re-claimed by another worker",
                seq
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("entry", &self.entry)
            .finish()
    }
}
