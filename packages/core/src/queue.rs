//! Queue entry types for work waiting in the `job_queue` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Sequence number of a queue entry.
///
/// Allocated from a monotonically increasing counter, so ordering by id is
/// ordering by insertion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of queued work.
///
/// `fetched_at` is `None` until a worker claims the entry. A claimed entry
/// stays in the table until the worker removes or requeues it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Validate a set of queue names a worker wants to fetch from.
///
/// Returns the trimmed, de-duplicated names in their original order.
pub fn normalize_queues<I, S>(queues: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = Vec::new();
    for queue in queues {
        let queue = queue.as_ref().trim();
        if queue.is_empty() {
            return None;
        }
        if !names.iter().any(|n| n == queue) {
            names.push(queue.to_string());
        }
    }

    if names.is_empty() { None } else { Some(names) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_empty_sets_and_blank_names() {
        assert_eq!(normalize_queues(Vec::<String>::new()), None);
        assert_eq!(normalize_queues(["default", " "]), None);
        assert_eq!(
            normalize_queues(["critical", "default", "critical"]),
            Some(vec!["critical".to_string(), "default".to_string()])
        );
    }
}
