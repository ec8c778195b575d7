//! Error taxonomy surfaced by the client.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::request::RequestDescriptor;
use crate::transport::TransportError;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Interceptor,
    Version,
    Dedup,
    Batch,
    Circuit,
    Transport,
    Queue,
    Mutation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Interceptor => "interceptor",
            Stage::Version => "version",
            Stage::Dedup => "dedup",
            Stage::Batch => "batch",
            Stage::Circuit => "circuit",
            Stage::Transport => "transport",
            Stage::Queue => "queue",
            Stage::Mutation => "mutation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Connectivity-level failure; always retryable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a non-success status.
    #[error("server responded with status {status}")]
    HttpStatus { status: u16, body: String },

    /// Rejected by the circuit breaker without touching the transport.
    #[error("circuit is open")]
    CircuitOpen,

    /// A queued request ran out of replay attempts.
    #[error("queued request exhausted its retries")]
    QueueExhausted,

    /// Concurrent optimistic mutations could not be reconciled.
    #[error("unresolvable mutation conflict on '{0}'")]
    Conflict(String),

    /// The breaker's per-call timeout fired.
    #[error("call timed out after {0} ms")]
    Timeout(u64),

    /// The caller's own deadline fired.
    #[error("caller deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,

    #[error("persistent store failure: {0}")]
    Store(String),

    #[error("response decode failure: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ErrorKind {
    /// True for failures caused by the network being unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ErrorKind::Transport(e) if e.is_connectivity())
    }
}

/// An error tagged with its origin and the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{stage}] {service} request {request_id} failed after {attempts} attempt(s): {kind}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub service: String,
    pub request_id: Uuid,
    /// Zero means the transport was never tried.
    pub attempts: u32,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, stage: Stage, request: &RequestDescriptor) -> Self {
        let attempts = match stage {
            Stage::Transport => 1,
            _ => 0,
        };
        Self {
            kind,
            stage,
            service: request.service_name.clone(),
            request_id: request.id,
            attempts,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.kind, ErrorKind::CircuitOpen)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let request = RequestDescriptor::get("billing", "/invoices");
        let err = ServiceError::new(ErrorKind::CircuitOpen, Stage::Circuit, &request);
        let text = err.to_string();
        assert!(text.contains("[circuit]"));
        assert!(text.contains("billing"));
        assert!(text.contains(&request.id.to_string()));
        assert!(text.contains("0 attempt"));
    }

    #[test]
    fn test_transport_errors_count_one_attempt() {
        let request = RequestDescriptor::get("billing", "/invoices");
        let err = ServiceError::new(
            TransportError::Connect("refused".into()).into(),
            Stage::Transport,
            &request,
        );
        assert_eq!(err.attempts, 1);
        assert!(err.kind.is_connectivity());
        assert!(!ErrorKind::Transport(TransportError::Timeout).is_connectivity());
    }
}
