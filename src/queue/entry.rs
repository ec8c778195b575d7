//! Queue entry and report types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::request::RequestDescriptor;

/// Store prefix for persisted entries.
pub const ENTRY_PREFIX: &str = "queue/";

pub fn store_key(id: &Uuid) -> String {
    format!("{}{}", ENTRY_PREFIX, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    /// Dead letter: kept until retried or discarded.
    Failed,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request: RequestDescriptor,
    pub attempts: u32,
    /// Milliseconds since the epoch; not replayed before this.
    pub next_attempt_at: u64,
    pub status: EntryStatus,
    /// Enqueue order, breaks `created_at` ties.
    pub sequence: u64,
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at <= now_ms
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { id: Uuid },
    Replayed { id: Uuid },
    Rescheduled { id: Uuid, attempts: u32, next_attempt_at: u64 },
    /// Retryable failures used up `max_retries`; carries a `QueueExhausted` error.
    Exhausted { entry: QueueEntry, error: ServiceError },
    /// The server refused the replay with a non-retryable error.
    Rejected { entry: QueueEntry, error: ServiceError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: Vec<Uuid>,
    pub rescheduled: Vec<Uuid>,
    pub dead_lettered: Vec<Uuid>,
    /// Entries left alone: not yet due or queued behind one that is.
    pub deferred: usize,
    /// Another drain was running; nothing was done.
    pub busy: bool,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.replayed.is_empty() && self.rescheduled.is_empty() && self.dead_lettered.is_empty()
    }
}
