//! Document metadata collaborator interface

use crate::error::Result;
use crate::key::DocumentKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persistent metadata for a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub tenant_id: String,
    pub document_id: String,
    /// Document this one was branched from
    pub parent_branch: Option<String>,
    pub created_at: u64,
}

/// Result of [`DocumentStorage::get_or_create_document`]
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDetails {
    /// Whether the document existed before this call
    pub existing: bool,
    pub value: DocumentRecord,
}

impl DocumentDetails {
    pub fn parent_branch(&self) -> Option<&str> {
        self.value.parent_branch.as_deref()
    }
}

#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Fetch the metadata record, creating it on first use
    async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails>;
}
