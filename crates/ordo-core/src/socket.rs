//! Broadcast group membership

use crate::error::Result;
use crate::key::DocumentKey;
use async_trait::async_trait;

/// A client transport that can be added to named broadcast groups
#[async_trait]
pub trait Socket: Send + Sync {
    async fn join(&self, group: &str) -> Result<()>;
}

/// Group receiving every sequenced message of a document
pub fn document_group(key: &DocumentKey) -> String {
    key.to_string()
}

/// Group addressing one client
pub fn client_group(client_id: &str) -> String {
    format!("client#{}", client_id)
}
