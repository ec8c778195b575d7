//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a service:
//!     → circuit_breaker.rs (admit, reject, or admit as probe)
//!     → timeouts.rs (call timeout vs. caller deadline)
//!     → outcome recorded on the permit
//!     → on failure: retries.rs classifies, backoff.rs schedules the replay
//! ```
//!
//! # Design Decisions
//! - Every external call has a deadline
//! - The breaker never retries; replay belongs to the offline queue
//! - Connection errors are always retryable; statuses are configurable

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{BreakerRegistry, BreakerState, CallPermit, CircuitBreaker, CircuitState};
pub use retries::RetryPolicy;
