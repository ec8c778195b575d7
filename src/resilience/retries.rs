//! Retry classification.
//!
//! Connectivity failures and timeouts are always transient; HTTP statuses are
//! transient only when listed in the configured set (429/502/503/504 by
//! default). Circuit-open and queue-exhausted errors are policy decisions and
//! never retried locally.

use crate::config::schema::RetryConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    retryable_statuses: Vec<u16>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retryable_statuses: config.retryable_statuses.clone(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Whether a response status should count against the breaker.
    pub fn is_failure_status(&self, status: u16) -> bool {
        status >= 500 || self.is_retryable_status(status)
    }

    pub fn is_retryable(&self, kind: &ErrorKind) -> bool {
        match kind {
            ErrorKind::Transport(_) | ErrorKind::Timeout(_) => true,
            ErrorKind::HttpStatus { status, .. } => self.is_retryable_status(*status),
            _ => false,
        }
    }
}
