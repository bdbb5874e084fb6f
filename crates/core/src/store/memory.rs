//! In-memory document store for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use super::{DocumentKey, DocumentStore};
use crate::errors::StoreError;

/// Volatile [`DocumentStore`] backed by a map.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentKey, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<DocumentKey, Value>>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::backend("memory store lock poisoned"))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn read(&self, key: DocumentKey) -> Result<Option<Value>, StoreError> {
        Ok(self.lock()?.get(&key).cloned())
    }

    fn write(&self, key: DocumentKey, document: &Value) -> Result<(), StoreError> {
        self.lock()?.insert(key, document.clone());
        Ok(())
    }

    fn delete(&self, key: DocumentKey) -> Result<(), StoreError> {
        self.lock()?.remove(&key);
        Ok(())
    }
}
