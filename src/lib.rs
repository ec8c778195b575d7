//! Resilient outbound service client library.
//!
//! # Architecture Overview
//!
//! ```text
//!   execute(descriptor)
//!        │
//!        ▼
//!   interceptor.on_request ─▶ version rewrite ─▶ dedup / batch ─▶ circuit breaker ─▶ transport
//!                                                                      │                 │
//!                                       offline queue ◀── offline / open circuit ◀──────┘
//!                                            │
//!                                   replay on reconnect ──▶ optimistic commit / rollback
//! ```

pub mod client;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod observability;
pub mod optimistic;
pub mod queue;
pub mod request;
pub mod resilience;
pub mod store;
pub mod transport;
pub mod version;

pub use client::{Client, ClientBuilder, ExecuteOutcome, MutationOutcome};
pub use config::schema::ClientConfig;
pub use error::{ErrorKind, ServiceError, ServiceResult, Stage};
pub use lifecycle::Shutdown;
pub use request::{Method, Priority, QueuePolicy, RequestDescriptor, Response};
