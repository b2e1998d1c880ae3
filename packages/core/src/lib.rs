//! Core domain types for the job queue storage.
//!
//! This crate contains shared types used across all packages:
//! - JobId and OwnerToken identifiers
//! - QueueEntry for rows of the queue table
//! - StorageOptions for polling, lease and expiration tunables
//! - Clock for every timestamp the storage persists

mod clock;
mod job;
mod options;
mod queue;

pub use clock::{Clock, ManualClock, SystemClock, from_millis, millis_before};
pub use job::{JobId, OwnerToken};
pub use options::{OptionsError, StorageOptions};
pub use queue::{EntryId, QueueEntry, normalize_queues};
