//! Request coalescing.
//!
//! # Data Flow
//! ```text
//! Request with batch_key and a configured batch endpoint:
//!     → batch.rs (collect for window_ms, one call for all unique keys)
//! Any other request:
//!     → dedup.rs (join an identical in-flight call or start one)
//! ```
//!
//! # Design Decisions
//! - Slots are removed as soon as the call settles; failures are never cached
//! - A dispatched call runs to completion even if every caller goes away

pub mod batch;
pub mod dedup;

pub use batch::{BatchFn, BatchLoader};
pub use dedup::Deduplicator;
