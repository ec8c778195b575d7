//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::request::Method;
use crate::version::VersionStrategy;

/// Root configuration for the resilient client.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Circuit breaker thresholds (defaults plus per-service overrides).
    pub breaker: BreakerSection,

    /// Offline queue scheduling.
    pub queue: QueueConfig,

    /// Which HTTP statuses are transient.
    pub retry: RetryConfig,

    /// Micro-batching and batch result caching.
    pub batch: BatchConfig,

    /// API version negotiation.
    pub version: VersionConfig,

    /// Endpoint resolution and transport timeouts.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time spent open before a probe is allowed, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Consecutive probe successes needed to close again.
    pub success_threshold: u32,

    /// Upper bound for a single call, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 1,
            call_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct BreakerSection {
    /// Applied to every service without an override.
    pub defaults: BreakerConfig,

    /// Per-service overrides keyed by service name.
    pub services: HashMap<String, BreakerConfig>,
}

impl BreakerSection {
    pub fn for_service(&self, service: &str) -> BreakerConfig {
        self.services.get(service).copied().unwrap_or(self.defaults)
    }
}

/// Offline queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,

    /// Periodic drain interval in milliseconds.
    pub drain_interval_ms: u64,

    /// Park requests rejected by an open circuit instead of surfacing them.
    pub queue_on_open_circuit: bool,

    /// Directory for the file-backed store (CLI and long-running workers).
    pub store_path: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
            drain_interval_ms: 15_000,
            queue_on_open_circuit: false,
            store_path: None,
        }
    }
}

/// Retry classification.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// HTTP statuses treated as transient failures.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retryable_statuses: vec![429, 502, 503, 504],
        }
    }
}

/// Batch loader configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Collection window in milliseconds.
    pub window_ms: u64,

    /// How long resolved values stay cached; 0 disables caching.
    pub cache_ttl_ms: u64,

    /// Batch endpoints keyed by service name.
    pub endpoints: HashMap<String, BatchEndpoint>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 10,
            cache_ttl_ms: 0,
            endpoints: HashMap::new(),
        }
    }
}

/// Endpoint accepting `{"keys": [...]}` and answering with a JSON array.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchEndpoint {
    pub path: String,

    #[serde(default = "default_batch_method")]
    pub method: Method,
}

fn default_batch_method() -> Method {
    Method::Post
}

/// Version negotiation configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VersionConfig {
    /// How the version travels on the wire.
    pub strategy: VersionStrategy,

    /// Version used when neither the request nor the server picked one.
    pub client_version: String,

    /// Response header carrying the server-advertised version.
    pub advertise_header: Option<String>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            strategy: VersionStrategy::Header {
                name: "api-version".to_string(),
            },
            client_version: "1".to_string(),
            advertise_header: None,
        }
    }
}

/// Endpoint resolution and transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL for services without their own entry.
    pub default_base_url: Option<String>,

    /// Per-service endpoints.
    pub services: HashMap<String, ServiceEndpoint>,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Whole-exchange timeout in milliseconds.
    pub request_timeout_ms: u64,

    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_base_url: None,
            services: HashMap::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            user_agent: concat!("resilient-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    pub fn base_url(&self, service: &str) -> Option<&str> {
        self.services
            .get(service)
            .map(|s| s.base_url.as_str())
            .or(self.default_base_url.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub base_url: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_override_lookup() {
        let mut section = BreakerSection::default();
        section.services.insert(
            "billing".into(),
            BreakerConfig {
                failure_threshold: 2,
                ..BreakerConfig::default()
            },
        );
        assert_eq!(section.for_service("billing").failure_threshold, 2);
        assert_eq!(section.for_service("users").failure_threshold, 5);
    }

    #[test]
    fn test_base_url_resolution() {
        let mut transport = TransportConfig::default();
        assert!(transport.base_url("users").is_none());
        transport.default_base_url = Some("http://fallback".into());
        transport.services.insert(
            "users".into(),
            ServiceEndpoint {
                base_url: "http://users.internal".into(),
            },
        );
        assert_eq!(transport.base_url("users"), Some("http://users.internal"));
        assert_eq!(transport.base_url("other"), Some("http://fallback"));
    }
}
