//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ClientConfig (validated, immutable)
//!     → held in an ArcSwap by the client
//!
//! On file change:
//!     Client::watch_config detects change (debounced)
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Client::reload_config swaps the Arc
//! ```
//!
//! # Design Decisions
//! - All fields have defaults so an empty file is a valid config
//! - Validation reports every error at once

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BatchConfig, BatchEndpoint, BreakerConfig, BreakerSection, ClientConfig, ObservabilityConfig,
    QueueConfig, RetryConfig, ServiceEndpoint, TransportConfig, VersionConfig,
};
pub use validation::{validate_config, ValidationError};
