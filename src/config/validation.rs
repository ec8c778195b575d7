//! Configuration validation.
//!
//! Serde handles syntax; this pass checks value ranges and URLs and returns
//! every problem found, not just the first.

use thiserror::Error;
use url::Url;

use crate::config::schema::{BreakerConfig, ClientConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{scope}: {field} must be greater than zero")]
    Zero { scope: String, field: &'static str },

    #[error("queue: max_delay_ms ({max}) is smaller than base_delay_ms ({base})")]
    BackoffRange { base: u64, max: u64 },

    #[error("retry: {0} is not an HTTP error status")]
    InvalidStatus(u16),

    #[error("transport: invalid base URL '{url}' for {scope}")]
    InvalidUrl { scope: String, url: String },

    #[error("batch: endpoint path for '{0}' must start with '/'")]
    BatchPath(String),

    #[error("version: client_version must not be empty")]
    EmptyVersion,
}

fn check_breaker(scope: &str, config: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    let checks: [(&'static str, u64); 4] = [
        ("failure_threshold", config.failure_threshold as u64),
        ("success_threshold", config.success_threshold as u64),
        ("reset_timeout_ms", config.reset_timeout_ms),
        ("call_timeout_ms", config.call_timeout_ms),
    ];
    for (field, value) in checks {
        if value == 0 {
            errors.push(ValidationError::Zero {
                scope: scope.to_string(),
                field,
            });
        }
    }
}

fn check_url(scope: &str, url: &str, errors: &mut Vec<ValidationError>) {
    let valid = Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid {
        errors.push(ValidationError::InvalidUrl {
            scope: scope.to_string(),
            url: url.to_string(),
        });
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_breaker("breaker.defaults", &config.breaker.defaults, &mut errors);
    let mut services: Vec<_> = config.breaker.services.iter().collect();
    services.sort_by(|a, b| a.0.cmp(b.0));
    for (name, breaker) in services {
        check_breaker(&format!("breaker.services.{}", name), breaker, &mut errors);
    }

    let queue = &config.queue;
    if queue.base_delay_ms == 0 {
        errors.push(ValidationError::Zero {
            scope: "queue".into(),
            field: "base_delay_ms",
        });
    }
    if queue.drain_interval_ms == 0 {
        errors.push(ValidationError::Zero {
            scope: "queue".into(),
            field: "drain_interval_ms",
        });
    }
    if queue.max_delay_ms < queue.base_delay_ms {
        errors.push(ValidationError::BackoffRange {
            base: queue.base_delay_ms,
            max: queue.max_delay_ms,
        });
    }

    for status in &config.retry.retryable_statuses {
        if !(400..600).contains(status) {
            errors.push(ValidationError::InvalidStatus(*status));
        }
    }

    for (service, endpoint) in &config.batch.endpoints {
        if !endpoint.path.starts_with('/') {
            errors.push(ValidationError::BatchPath(service.clone()));
        }
    }

    if config.version.client_version.trim().is_empty() {
        errors.push(ValidationError::EmptyVersion);
    }

    if let Some(url) = &config.transport.default_base_url {
        check_url("default_base_url", url, &mut errors);
    }
    for (service, endpoint) in &config.transport.services {
        check_url(service, &endpoint.base_url, &mut errors);
    }
    if config.transport.connect_timeout_ms == 0 {
        errors.push(ValidationError::Zero {
            scope: "transport".into(),
            field: "connect_timeout_ms",
        });
    }
    if config.transport.request_timeout_ms == 0 {
        errors.push(ValidationError::Zero {
            scope: "transport".into(),
            field: "request_timeout_ms",
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
