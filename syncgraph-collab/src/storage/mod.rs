//! Persistent storage for documents.
//!
//! ```text
//! ┌──────────────┐  load / save   ┌──────────────────┐
//! │ loader       │ ─────────────► │ dyn DocumentStore│
//! └──────────────┘                │                  │
//! ┌──────────────┐  append        │  MemoryStore     │
//! │ SyncServer   │ ─────────────► │  RocksStore      │
//! └──────────────┘                └──────────────────┘
//! ```
//!
//! A store holds one [`PersistedDocument`] per id. Clients replace the
//! whole payload with `save`; the relay extends an already saved
//! document's history with `append` as batches go through it.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use syncgraph_core::{Operation, PersistedDocument};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A keyed document store.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document; `Ok(None)` when the id is unknown.
    fn load(&self, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError>;

    /// Replace the stored payload for `doc.id`.
    fn save(&self, doc: &PersistedDocument) -> Result<(), StoreError>;

    /// Extend a saved document's history. Fails with `NotFound` when the
    /// document was never saved. Returns the new history length.
    fn append(&self, doc_id: &str, operations: &[Operation]) -> Result<usize, StoreError>;

    /// Ids of every stored document, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Remove a document. Returns whether it existed.
    fn delete(&self, doc_id: &str) -> Result<bool, StoreError>;
}
