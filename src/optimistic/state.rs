//! Local state store the mutation manager writes speculative values into.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Shared view of locally known resource values, keyed by target key.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    values: Arc<DashMap<String, Value>>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Write `value`, or clear the key when there is none.
    pub(crate) fn restore(&self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => self.set(key, value),
            None => {
                self.remove(key);
            }
        }
    }
}
