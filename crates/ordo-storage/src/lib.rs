//! Ordo Storage Backends
//!
//! Implements the collaborators the orderers depend on:
//! - Memory (default): partitioned log with live tails, document records
//! - SQLite: durable log, documents, leases and node table in one file
//!
//! Lease and node stores for a single process live in `ordo-core`.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<StorageError> for ordo_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Serialization(msg) => ordo_core::Error::Serialization(msg),
            other => ordo_core::Error::Storage(other.to_string()),
        }
    }
}

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub document_count: usize,
    pub partition_count: usize,
    pub record_count: usize,
}

pub use memory::{MemoryDocumentStorage, MemoryLog};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
