//! In-process store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::{KeyValueStore, StoreError};

/// Thread-safe map-backed store. Clones share the same data, which lets
/// tests simulate a restart by opening a second queue over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
