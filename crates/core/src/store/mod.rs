//! Persisted document replica shared by the UI and the sync pipeline.

mod memory;

pub use memory::MemoryDocumentStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StoreError;

/// Logical documents held by the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKey {
    #[serde(rename = "cart")]
    Cart,
    #[serde(rename = "favorites")]
    Favorites,
    #[serde(rename = "history")]
    History,
    #[serde(rename = "syncQueue")]
    SyncQueue,
}

impl DocumentKey {
    pub const ALL: [DocumentKey; 4] = [
        DocumentKey::Cart,
        DocumentKey::Favorites,
        DocumentKey::History,
        DocumentKey::SyncQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKey::Cart => "cart",
            DocumentKey::Favorites => "favorites",
            DocumentKey::History => "history",
            DocumentKey::SyncQueue => "syncQueue",
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend contract for whole-document reads and writes.
pub trait DocumentStore: Send + Sync {
    fn read(&self, key: DocumentKey) -> Result<Option<Value>, StoreError>;
    fn write(&self, key: DocumentKey, document: &Value) -> Result<(), StoreError>;
    fn delete(&self, key: DocumentKey) -> Result<(), StoreError>;
}

type Snapshot = HashMap<DocumentKey, Value>;

/// In-process replica over a [`DocumentStore`].
///
/// Readers get the in-memory snapshot without touching the backend. Writers
/// persist first and only then update the snapshot, under one lock, so a
/// concurrent read never observes a state the backend did not accept.
pub struct LocalReplica {
    backend: Arc<dyn DocumentStore>,
    snapshot: RwLock<Snapshot>,
}

impl LocalReplica {
    /// Load every document from the backend into the snapshot.
    pub fn open(backend: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let mut snapshot = Snapshot::new();
        for key in DocumentKey::ALL {
            if let Some(document) = backend.read(key)? {
                snapshot.insert(key, document);
            }
        }
        Ok(Self {
            backend,
            snapshot: RwLock::new(snapshot),
        })
    }

    /// Raw snapshot read. Absent documents are `None`.
    pub fn read(&self, key: DocumentKey) -> Option<Value> {
        self.lock_read().get(&key).cloned()
    }

    /// Typed snapshot read. Absent documents decode as `T::default()`.
    pub fn read_as<T>(&self, key: DocumentKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        match self.read(key) {
            Some(document) => serde_json::from_value(document)
                .map_err(|err| StoreError::corrupted(key.as_str(), err)),
            None => Ok(T::default()),
        }
    }

    /// Persist a document, then publish it to the snapshot.
    pub fn write(&self, key: DocumentKey, document: Value) -> Result<(), StoreError> {
        let mut snapshot = self.lock_write();
        self.backend.write(key, &document)?;
        snapshot.insert(key, document);
        Ok(())
    }

    /// Serialize and persist a typed document.
    pub fn write_as<T: Serialize>(&self, key: DocumentKey, value: &T) -> Result<(), StoreError> {
        let document = serde_json::to_value(value)?;
        self.write(key, document)
    }

    /// Remove a document from the backend and the snapshot.
    pub fn delete(&self, key: DocumentKey) -> Result<(), StoreError> {
        let mut snapshot = self.lock_write();
        self.backend.delete(key)?;
        snapshot.remove(&key);
        Ok(())
    }

    /// Read-modify-write as one critical section. Returns the state the
    /// reducer produced, which is also what was persisted.
    pub fn update<T, F>(&self, key: DocumentKey, reduce: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let mut snapshot = self.lock_write();
        let mut typed: T = match snapshot.get(&key) {
            Some(document) => serde_json::from_value(document.clone())
                .map_err(|err| StoreError::corrupted(key.as_str(), err))?,
            None => T::default(),
        };
        reduce(&mut typed);
        let document = serde_json::to_value(&typed)?;
        self.backend.write(key, &document)?;
        snapshot.insert(key, document);
        Ok(typed)
    }

    // A poisoned lock only means a writer panicked; the map itself stays valid.
    fn lock_read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend whose writes can be switched to fail, for write-through checks.
    struct FlakyStore {
        inner: MemoryDocumentStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryDocumentStore::new(),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    impl DocumentStore for FlakyStore {
        fn read(&self, key: DocumentKey) -> Result<Option<Value>, StoreError> {
            self.inner.read(key)
        }

        fn write(&self, key: DocumentKey, document: &Value) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::backend("disk full"));
            }
            self.inner.write(key, document)
        }

        fn delete(&self, key: DocumentKey) -> Result<(), StoreError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn document_keys_serialize_to_their_wire_names() {
        let names = DocumentKey::ALL
            .iter()
            .map(|key| serde_json::to_string(key).expect("serialize document key"))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["\"cart\"", "\"favorites\"", "\"history\"", "\"syncQueue\""]
        );
    }

    #[test]
    fn open_loads_existing_documents() {
        let backend = Arc::new(MemoryDocumentStore::new());
        backend
            .write(DocumentKey::Cart, &json!({"lines": []}))
            .expect("seed cart");

        let replica = LocalReplica::open(backend).expect("open replica");
        assert_eq!(replica.read(DocumentKey::Cart), Some(json!({"lines": []})));
        assert_eq!(replica.read(DocumentKey::Favorites), None);
    }

    #[test]
    fn write_reaches_backend_and_snapshot() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let replica = LocalReplica::open(Arc::clone(&backend) as Arc<dyn DocumentStore>)
            .expect("open replica");

        replica
            .write(DocumentKey::Favorites, json!({"entries": []}))
            .expect("write favorites");

        assert_eq!(
            replica.read(DocumentKey::Favorites),
            Some(json!({"entries": []}))
        );
        assert_eq!(
            backend.read(DocumentKey::Favorites).expect("backend read"),
            Some(json!({"entries": []}))
        );
    }

    #[test]
    fn failed_backend_write_leaves_snapshot_unchanged() {
        let backend = Arc::new(FlakyStore::new());
        let replica = LocalReplica::open(Arc::clone(&backend) as Arc<dyn DocumentStore>)
            .expect("open replica");
        replica
            .write(DocumentKey::Cart, json!({"lines": [{"productId": "p1", "quantity": 1}]}))
            .expect("first write");

        backend.fail_writes.store(true, Ordering::SeqCst);
        let result = replica.write(DocumentKey::Cart, json!({"lines": []}));
        assert!(result.is_err());

        // The snapshot still holds the last durably committed state.
        assert_eq!(
            replica.read(DocumentKey::Cart),
            Some(json!({"lines": [{"productId": "p1", "quantity": 1}]}))
        );
    }

    #[test]
    fn read_as_defaults_when_missing() {
        let replica =
            LocalReplica::open(Arc::new(MemoryDocumentStore::new())).expect("open replica");
        let entries: Vec<Value> = replica
            .read_as(DocumentKey::SyncQueue)
            .expect("read empty queue");
        assert!(entries.is_empty());
    }

    #[test]
    fn read_as_reports_corrupted_documents() {
        let backend = Arc::new(MemoryDocumentStore::new());
        backend
            .write(DocumentKey::Cart, &json!("not a cart"))
            .expect("seed garbage");
        let replica = LocalReplica::open(backend).expect("open replica");

        let result: Result<Vec<Value>, _> = replica.read_as(DocumentKey::Cart);
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn update_persists_the_reduced_state() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let replica = LocalReplica::open(Arc::clone(&backend) as Arc<dyn DocumentStore>)
            .expect("open replica");

        let produced: Vec<String> = replica
            .update(DocumentKey::History, |entries: &mut Vec<String>| {
                entries.push("p1".to_string());
            })
            .expect("update history");

        assert_eq!(produced, vec!["p1".to_string()]);
        assert_eq!(
            backend.read(DocumentKey::History).expect("backend read"),
            Some(json!(["p1"]))
        );
    }

    #[test]
    fn delete_removes_document() {
        let replica =
            LocalReplica::open(Arc::new(MemoryDocumentStore::new())).expect("open replica");
        replica
            .write(DocumentKey::History, json!([]))
            .expect("write history");
        replica.delete(DocumentKey::History).expect("delete history");
        assert_eq!(replica.read(DocumentKey::History), None);
    }
}
