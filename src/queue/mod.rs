//! Offline queue subsystem.
//!
//! # Data Flow
//! ```text
//! Request fails while offline (or circuit open, if configured):
//!     → offline.rs enqueue (persisted as queue/<id>)
//! Connectivity restored / drain interval elapsed:
//!     → offline.rs drain (priority, age, per-resource sequencing)
//!     → success: entry deleted
//!     → retryable failure: attempts += 1, backoff, or dead letter
//! ```
//!
//! # Design Decisions
//! - An entry is never dropped silently; exhaustion leaves a dead letter
//! - Open circuits postpone replays without spending attempts

pub mod entry;
pub mod offline;

pub use entry::{DrainReport, EntryStatus, QueueEntry, QueueEvent, QueueStats};
pub use offline::OfflineQueue;
