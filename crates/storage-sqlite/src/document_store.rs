//! Durable document backend over a single-file SQLite database.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use mercato_core::errors::StoreError;
use mercato_core::store::{DocumentKey, DocumentStore};

/// SQLite-backed [`DocumentStore`].
///
/// One `documents` table keyed by document name, bodies as JSON text.
/// Connections run in WAL mode with a busy timeout so a concurrent reader
/// does not fail a write. Every write commits before it returns; a process
/// kill loses at most the write in flight.
pub struct SqliteDocumentStore {
    connection: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Open the database at `path`, creating file and schema as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection =
            Connection::open(path.as_ref()).map_err(|err| StoreError::backend(err.to_string()))?;
        debug!("opened document store at {}", path.as_ref().display());
        Self::initialize(connection)
    }

    /// In-memory database for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection =
            Connection::open_in_memory().map_err(|err| StoreError::backend(err.to_string()))?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Self, StoreError> {
        connection
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS documents (
                     key TEXT PRIMARY KEY NOT NULL,
                     body TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )
            .map_err(|err| StoreError::backend(err.to_string()))?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::backend("sqlite connection lock poisoned"))
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn read(&self, key: DocumentKey) -> Result<Option<Value>, StoreError> {
        let connection = self.lock()?;
        let body: Option<String> = connection
            .query_row(
                "SELECT body FROM documents WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::backend(err.to_string()))?;

        match body {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| StoreError::corrupted(key.as_str(), err)),
            None => Ok(None),
        }
    }

    fn write(&self, key: DocumentKey, document: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(document)?;
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO documents (key, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     body = excluded.body,
                     updated_at = excluded.updated_at",
                params![key.as_str(), body, Utc::now().to_rfc3339()],
            )
            .map_err(|err| StoreError::backend(err.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: DocumentKey) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection
            .execute(
                "DELETE FROM documents WHERE key = ?1",
                params![key.as_str()],
            )
            .map_err(|err| StoreError::backend(err.to_string()))?;
        Ok(())
    }
}
