//! Persistent key-value store used for queue durability.
//!
//! # Design Decisions
//! - Values are opaque bytes; callers serialize (JSON for queue entries)
//! - Single-key writes are atomic; there are no multi-key transactions
//! - `list_by_prefix` returns entries sorted by key

use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}
