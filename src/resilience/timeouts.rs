//! Timeout enforcement.
//!
//! Every dispatched call is bounded by the breaker's `call_timeout_ms` and,
//! independently, by the caller's deadline. Whichever is earlier fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elapsed {
    /// The per-call bound fired; counts as a breaker failure.
    CallTimeout(u64),
    /// The caller's deadline fired first.
    Deadline,
}

pub async fn bounded<F: Future>(
    call_timeout: Duration,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    let call_deadline = Instant::now() + call_timeout;
    match deadline {
        Some(deadline) if deadline < call_deadline => timeout_at(deadline, fut)
            .await
            .map_err(|_| Elapsed::Deadline),
        _ => timeout_at(call_deadline, fut)
            .await
            .map_err(|_| Elapsed::CallTimeout(call_timeout.as_millis() as u64)),
    }
}
