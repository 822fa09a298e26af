//! Keyed JSON state store seam.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// Errors from a [`StateStore`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Backing storage failed.
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes were not valid JSON.
    #[error("state store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Id cannot be used as a key.
    #[error("invalid state id: {0}")]
    InvalidId(String),
}

/// Keyed JSON blobs. Implementations decide durability.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value, `None` when never written.
    async fn get(&self, id: &str) -> Result<Option<Value>, StateError>;

    /// Overwrite a value.
    async fn set(&self, id: &str, value: Value) -> Result<(), StateError>;

    /// Remove a value. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StateError>;

    /// Ids currently stored.
    async fn list(&self) -> Result<Vec<String>, StateError>;
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStateStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<Value>, StateError> {
        Ok(self.values.read().get(id).cloned())
    }

    async fn set(&self, id: &str, value: Value) -> Result<(), StateError> {
        let _ = self.values.write().insert(id.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StateError> {
        Ok(self.values.write().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, StateError> {
        let mut ids: Vec<String> = self.values.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
