//! Process-wide cache of log-backed orderers

use crate::error::Result;
use crate::key::DocumentKey;
use crate::orderer::LogOrderer;
use crate::producer::Producer;
use crate::storage::DocumentStorage;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

/// Hands out exactly one [`LogOrderer`] per document key.
///
/// Each key maps to a cell that is either pending (empty, possibly being
/// filled) or resolved. The cell is inserted before the first suspension
/// point, so concurrent callers wait on the same construction. A failed
/// construction leaves the cell empty, and the next caller starts over.
pub struct LogOrdererFactory {
    producer: Arc<dyn Producer>,
    storage: Arc<dyn DocumentStorage>,
    ingress: String,
    orderers: DashMap<String, Arc<OnceCell<Arc<LogOrderer>>>>,
}

impl LogOrdererFactory {
    pub fn new(producer: Arc<dyn Producer>, storage: Arc<dyn DocumentStorage>, ingress: &str) -> Self {
        Self {
            producer,
            storage,
            ingress: ingress.to_string(),
            orderers: DashMap::new(),
        }
    }

    pub async fn create(&self, key: &DocumentKey) -> Result<Arc<LogOrderer>> {
        let cell = self
            .orderers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                LogOrderer::create(
                    self.storage.as_ref(),
                    self.producer.clone(),
                    key.clone(),
                    &self.ingress,
                )
                .await
                .map(Arc::new)
            })
            .await;

        match result {
            Ok(orderer) => Ok(orderer.clone()),
            Err(e) => {
                warn!(document = %key, error = %e, "Orderer construction failed");
                Err(e)
            }
        }
    }

    /// Resolved orderer for `key`, if any
    pub fn get(&self, key: &DocumentKey) -> Option<Arc<LogOrderer>> {
        self.orderers
            .get(&key.to_string())
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Number of resolved orderers
    pub fn len(&self) -> usize {
        self.orderers
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyStorage, RecordingProducer};
    use std::time::Duration;

    fn factory(storage: Arc<FlakyStorage>) -> LogOrdererFactory {
        LogOrdererFactory::new(Arc::new(RecordingProducer::default()), storage, "ingress")
    }

    #[tokio::test]
    async fn test_concurrent_create_shares_one_orderer() {
        let storage = Arc::new(FlakyStorage::with_delay(0, Duration::from_millis(20)));
        let factory = factory(storage.clone());
        let key = DocumentKey::new("t1", "doc1").unwrap();

        let (a, b) = tokio::join!(factory.create(&key), factory.create(&key));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(storage.calls(), 1);
        assert_eq!(factory.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_cache() {
        let storage = Arc::new(FlakyStorage::new(1));
        let factory = factory(storage.clone());
        let key = DocumentKey::new("t1", "doc1").unwrap();

        assert!(factory.create(&key).await.is_err());
        assert!(factory.get(&key).is_none());
        assert!(factory.is_empty());

        let orderer = factory.create(&key).await.unwrap();
        assert_eq!(storage.calls(), 2);
        assert!(Arc::ptr_eq(&orderer, &factory.get(&key).unwrap()));
    }

    #[tokio::test]
    async fn test_distinct_documents_get_distinct_orderers() {
        let storage = Arc::new(FlakyStorage::new(0));
        let factory = factory(storage);

        let a = factory.create(&DocumentKey::new("t1", "doc1").unwrap()).await.unwrap();
        let b = factory.create(&DocumentKey::new("t2", "doc1").unwrap()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.len(), 2);
    }
}
