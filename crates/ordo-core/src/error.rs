//! Error types for Ordo Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Document {key} is reserved by node {owner}")]
    ReservationConflict { key: String, owner: String },

    #[error("Document is not ordered locally: {0}")]
    NotLocal(String),

    #[error("Lease lost for document: {0}")]
    LeaseLost(String),

    #[error("Log append failed: {0}")]
    LogAppend(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid document key: {0}")]
    InvalidDocumentKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Expected ownership conflicts. These route a document to the
    /// log-backed path instead of reaching the caller.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Error::ReservationConflict { .. } | Error::NotLocal(_) | Error::LeaseLost(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for Ordo Core operations
pub type Result<T> = std::result::Result<T, Error>;
