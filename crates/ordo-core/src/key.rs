//! Document keys

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum length of a tenant or document id
pub const MAX_ID_LEN: usize = 256;

/// Globally unique document identity: `(tenantId, documentId)`.
///
/// Rendered as `tenant/document`, which is also the orderer cache key and
/// the name of the document's broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    tenant_id: String,
    document_id: String,
}

impl DocumentKey {
    /// Create a new key, validating both halves
    pub fn new(tenant_id: impl Into<String>, document_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        let document_id = document_id.into();

        validate_id("tenant", &tenant_id)?;
        validate_id("document", &document_id)?;

        Ok(Self { tenant_id, document_id })
    }

    /// Parse a `tenant/document` string
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((tenant, document)) => Self::new(tenant, document),
            None => Err(Error::InvalidDocumentKey(format!("expected tenant/document, got {}", s))),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Partition key used when appending to the log
    pub fn partition_key(&self) -> &str {
        &self.document_id
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.document_id)
    }
}

// Pattern: [a-zA-Z0-9:._-]+
fn validate_id(what: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidDocumentKey(format!("{} id cannot be empty", what)));
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidDocumentKey(format!(
            "{} id exceeds {} bytes",
            what, MAX_ID_LEN
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'))
    {
        return Err(Error::InvalidDocumentKey(format!(
            "{} id must match pattern [a-zA-Z0-9:._-]+",
            what
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_valid() {
        let key = DocumentKey::new("t1", "doc1").unwrap();
        assert_eq!(key.to_string(), "t1/doc1");
        assert_eq!(key.partition_key(), "doc1");
        assert!(DocumentKey::new("acme.corp", "notes_2024-01:draft").is_ok());
    }

    #[test]
    fn test_key_invalid() {
        assert!(DocumentKey::new("", "doc").is_err());
        assert!(DocumentKey::new("t1", "").is_err());
        assert!(DocumentKey::new("t1", "a/b").is_err());
        assert!(DocumentKey::new("t1", "a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_parse() {
        let key = DocumentKey::parse("t1/doc1").unwrap();
        assert_eq!(key.tenant_id(), "t1");
        assert_eq!(key.document_id(), "doc1");
        assert!(DocumentKey::parse("nodelimiter").is_err());
    }
}
