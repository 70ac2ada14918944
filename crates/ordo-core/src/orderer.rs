//! Orderers: per-document sources of connections

use crate::connection::{LogOrdererConnection, OrdererConnection};
use crate::error::Result;
use crate::key::DocumentKey;
use crate::producer::Producer;
use crate::socket::Socket;
use crate::storage::{DocumentDetails, DocumentStorage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Assigns total order to one document's operations
#[async_trait]
pub trait Orderer: Send + Sync {
    fn key(&self) -> &DocumentKey;

    /// Open a connection for a client. `client` is the opaque descriptor
    /// carried in the Join message.
    async fn connect(
        &self,
        socket: &dyn Socket,
        user: serde_json::Value,
        client: serde_json::Value,
    ) -> Result<Box<dyn OrdererConnection>>;

    async fn close(&self) -> Result<()>;
}

/// Orderer backed by the shared log
pub struct LogOrderer {
    key: DocumentKey,
    details: DocumentDetails,
    producer: Arc<dyn Producer>,
    existing: AtomicBool,
    ingress: String,
}

impl LogOrderer {
    /// Load (or create) the document's metadata and build the orderer
    pub async fn create(
        storage: &dyn DocumentStorage,
        producer: Arc<dyn Producer>,
        key: DocumentKey,
        ingress: &str,
    ) -> Result<Self> {
        let details = storage.get_or_create_document(&key).await?;
        info!(document = %key, existing = details.existing, "Created log orderer");

        Ok(Self {
            existing: AtomicBool::new(details.existing),
            key,
            details,
            producer,
            ingress: ingress.to_string(),
        })
    }

    pub fn existing(&self) -> bool {
        self.existing.load(Ordering::SeqCst)
    }

    pub fn parent_branch(&self) -> Option<&str> {
        self.details.parent_branch()
    }
}

#[async_trait]
impl Orderer for LogOrderer {
    fn key(&self) -> &DocumentKey {
        &self.key
    }

    async fn connect(
        &self,
        socket: &dyn Socket,
        user: serde_json::Value,
        client: serde_json::Value,
    ) -> Result<Box<dyn OrdererConnection>> {
        let connection = LogOrdererConnection::create(
            self.existing(),
            &self.details.value,
            self.producer.clone(),
            self.key.clone(),
            socket,
            user,
            client,
            &self.ingress,
        )
        .await?;

        // The document exists for everyone after the first connect
        self.existing.store(true, Ordering::SeqCst);

        Ok(Box::new(connection))
    }

    async fn close(&self) -> Result<()> {
        // The log outlives any single orderer
        Ok(())
    }
}

impl std::fmt::Debug for LogOrderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogOrderer")
            .field("key", &self.key)
            .field("existing", &self.existing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyStorage, RecordingProducer, RecordingSocket};
    use serde_json::json;

    #[tokio::test]
    async fn test_existing_flips_after_first_connect() {
        let storage = FlakyStorage::new(0);
        let producer = Arc::new(RecordingProducer::default());
        let key = DocumentKey::new("t1", "doc1").unwrap();

        let orderer = LogOrderer::create(&storage, producer, key, "ingress").await.unwrap();
        assert!(!orderer.existing());

        let socket = RecordingSocket::default();
        let first = orderer.connect(&socket, json!({}), json!({})).await.unwrap();
        assert!(!first.existing());
        assert!(orderer.existing());

        let second = orderer.connect(&socket, json!({}), json!({})).await.unwrap();
        assert!(second.existing());
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_existing_false() {
        let storage = FlakyStorage::new(0);
        let producer = Arc::new(RecordingProducer::default());
        let key = DocumentKey::new("t1", "doc2").unwrap();
        let orderer = LogOrderer::create(&storage, producer.clone(), key, "ingress").await.unwrap();

        producer.set_failing(true);
        let socket = RecordingSocket::default();
        assert!(orderer.connect(&socket, json!({}), json!({})).await.is_err());
        assert!(!orderer.existing());
    }

    #[tokio::test]
    async fn test_create_propagates_storage_failure() {
        let storage = FlakyStorage::new(1);
        let producer = Arc::new(RecordingProducer::default());
        let key = DocumentKey::new("t1", "doc3").unwrap();
        assert!(LogOrderer::create(&storage, producer, key, "ingress").await.is_err());
    }
}
