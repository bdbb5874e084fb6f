//! SQLite persistence for the commerce replica.

mod document_store;

pub use document_store::SqliteDocumentStore;
