//! Orderer Manager - picks the local or log-backed path per document

use crate::error::Result;
use crate::factory::LogOrdererFactory;
use crate::key::DocumentKey;
use crate::local::LocalOrderManager;
use crate::orderer::Orderer;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Path a document is ordered through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// In-memory on this node, under a lease
    Local,
    /// Through the shared log
    Log,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Local => write!(f, "local"),
            Route::Log => write!(f, "log"),
        }
    }
}

/// Dispatches documents to an orderer.
///
/// The local path is tried first. Expected ownership conflicts send the
/// document to the log-backed factory, and once there it stays there for the
/// lifetime of the process.
pub struct OrdererManager {
    local: Option<Arc<LocalOrderManager>>,
    factory: Arc<LogOrdererFactory>,
    log_routed: DashMap<String, ()>,
}

impl OrdererManager {
    pub fn new(local: Option<Arc<LocalOrderManager>>, factory: Arc<LogOrdererFactory>) -> Self {
        Self {
            local,
            factory,
            log_routed: DashMap::new(),
        }
    }

    /// Log-backed only
    pub fn log_only(factory: Arc<LogOrdererFactory>) -> Self {
        Self::new(None, factory)
    }

    pub async fn get_orderer(&self, key: &DocumentKey) -> Result<Arc<dyn Orderer>> {
        let id = key.to_string();

        if !self.log_routed.contains_key(&id) {
            if let Some(local) = &self.local {
                match local.get_orderer(key).await {
                    Ok(orderer) => return Ok(orderer),
                    Err(e) if e.is_fallback() => {
                        debug!(document = %key, reason = %e, "Local ordering unavailable");
                        info!(document = %key, "Routing document through the log");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.log_routed.insert(id, ());
        }

        let orderer = self.factory.create(key).await?;
        Ok(orderer)
    }

    /// Current route of a document, if it has been dispatched
    pub fn route(&self, key: &DocumentKey) -> Option<Route> {
        if self.log_routed.contains_key(&key.to_string()) {
            return Some(Route::Log);
        }
        self.local
            .as_ref()
            .and_then(|local| local.get(key))
            .filter(|orderer| orderer.is_active())
            .map(|_| Route::Local)
    }

    pub fn local(&self) -> Option<&Arc<LocalOrderManager>> {
        self.local.as_ref()
    }

    pub fn factory(&self) -> &Arc<LogOrdererFactory> {
        &self.factory
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            local_documents: self.local.as_ref().map_or(0, |local| local.held().len()),
            log_documents: self.log_routed.len(),
        }
    }
}

/// Routing statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub local_documents: usize,
    pub log_documents: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::error::Error;
    use crate::node::{MemoryNodeStore, NodeManager};
    use crate::reservation::{MemoryLeaseStore, ReservationManager};
    use crate::storage::DocumentStorage;
    use crate::testing::{FlakyStorage, RecordingProducer, RecordingSocket};
    use serde_json::json;
    use std::time::Duration;

    struct Setup {
        leases: Arc<MemoryLeaseStore>,
        nodes: Arc<MemoryNodeStore>,
        producer: Arc<RecordingProducer>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                leases: Arc::new(MemoryLeaseStore::new()),
                nodes: Arc::new(MemoryNodeStore::new()),
                producer: Arc::new(RecordingProducer::default()),
            }
        }

        async fn manager(&self, node_id: &str, ttl_ms: u64, storage: Arc<dyn DocumentStorage>) -> OrdererManager {
            let node = Arc::new(NodeManager::new(node_id, "127.0.0.1:0", self.nodes.clone(), Duration::from_secs(30)));
            node.heartbeat().await.unwrap();
            let reservations = Arc::new(ReservationManager::new(self.leases.clone(), Duration::from_millis(ttl_ms)));
            let local = LocalOrderManager::new(node, reservations, storage.clone(), Arc::new(BroadcastHub::new()), "ingress");
            let factory = LogOrdererFactory::new(self.producer.clone(), storage, "ingress");
            OrdererManager::new(Some(Arc::new(local)), Arc::new(factory))
        }
    }

    fn key() -> DocumentKey {
        DocumentKey::new("t1", "doc1").unwrap()
    }

    #[tokio::test]
    async fn test_prefers_local() {
        let setup = Setup::new();
        let manager = setup.manager("n1", 60_000, Arc::new(FlakyStorage::new(0))).await;

        manager.get_orderer(&key()).await.unwrap();
        assert_eq!(manager.route(&key()), Some(Route::Local));
        assert_eq!(manager.stats(), RoutingStats { local_documents: 1, log_documents: 0 });
        assert!(manager.factory().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_falls_back_to_log() {
        let setup = Setup::new();
        let n1 = setup.manager("n1", 60_000, Arc::new(FlakyStorage::new(0))).await;
        let n2 = setup.manager("n2", 60_000, Arc::new(FlakyStorage::new(0))).await;

        n1.get_orderer(&key()).await.unwrap();
        let orderer = n2.get_orderer(&key()).await.unwrap();
        assert_eq!(n2.route(&key()), Some(Route::Log));

        // Connections on the fallback path go through the log
        let socket = RecordingSocket::default();
        orderer.connect(&socket, json!({}), json!({})).await.unwrap();
        assert_eq!(setup.producer.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_log_route_is_sticky() {
        let setup = Setup::new();
        let n1 = setup.manager("n1", 40, Arc::new(FlakyStorage::new(0))).await;
        let n2 = setup.manager("n2", 60_000, Arc::new(FlakyStorage::new(0))).await;

        n1.get_orderer(&key()).await.unwrap();
        let first = n2.get_orderer(&key()).await.unwrap();

        // The lease becomes available, but n2 keeps using the log
        tokio::time::sleep(Duration::from_millis(70)).await;
        let second = n2.get_orderer(&key()).await.unwrap();
        assert_eq!(n2.route(&key()), Some(Route::Log));
        assert!(std::ptr::eq(
            Arc::as_ptr(&first) as *const u8,
            Arc::as_ptr(&second) as *const u8
        ));
        assert_eq!(n2.stats().local_documents, 0);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let setup = Setup::new();
        let manager = setup.manager("n1", 60_000, Arc::new(FlakyStorage::new(1))).await;

        let err = manager.get_orderer(&key()).await.err().unwrap();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(manager.route(&key()), None);

        // Local path is retried on the next call, and the lease it took was released
        manager.get_orderer(&key()).await.unwrap();
        assert_eq!(manager.route(&key()), Some(Route::Local));
    }

    #[tokio::test]
    async fn test_log_only_manager() {
        let setup = Setup::new();
        let storage = Arc::new(FlakyStorage::new(0));
        let factory = Arc::new(LogOrdererFactory::new(setup.producer.clone(), storage, "ingress"));
        let manager = OrdererManager::log_only(factory);

        manager.get_orderer(&key()).await.unwrap();
        assert_eq!(manager.route(&key()), Some(Route::Log));
        assert_eq!(manager.stats().log_documents, 1);
    }
}
