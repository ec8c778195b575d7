//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (service, request_id, attempt, state fields)
//!     → metrics.rs (counters, gauges, histograms via the `metrics` facade)
//!
//! Consumers:
//!     → logging.rs installs the fmt subscriber
//!     → Prometheus scrape endpoint when enabled
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until a recorder is installed
//! - Request ID flows through every log line of a call

pub mod logging;
pub mod metrics;
