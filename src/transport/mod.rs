//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! circuit-gated dispatch
//!     → TransportRequest (method, absolute URL, headers, body)
//!     → Transport::send (one HTTP exchange, no retries)
//!     → TransportResponse for any status, TransportError otherwise
//! ```
//!
//! # Design Decisions
//! - Connectivity failures (DNS, refused) are distinct from HTTP error statuses;
//!   only the former park requests in the offline queue
//! - Status codes are never errors at this layer

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::request::Method;

pub mod http;

pub use http::HttpTransport;

/// Errors raised before a status line was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Name resolution or connection establishment failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The exchange did not finish within the transport's own timeout.
    #[error("transport timed out")]
    Timeout,

    /// Any other I/O or protocol failure.
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Performs a single HTTP exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
