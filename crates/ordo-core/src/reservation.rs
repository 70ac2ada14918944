//! Document leases: exclusive, time-bounded local ordering rights

use crate::clock;
use crate::error::{Error, Result};
use crate::key::DocumentKey;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A node's claim over a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Expiry in unix milliseconds
    pub expires_at: u64,
}

impl Lease {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// Shared source of truth for leases across the fleet
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically create or renew `node_id`'s lease on `key`, expiring
    /// `ttl` from now. Fails with [`Error::ReservationConflict`] while a
    /// different node holds a live lease.
    async fn reserve(&self, node_id: &str, key: &str, ttl: Duration) -> Result<Lease>;

    /// Drop the lease if `node_id` holds it. Returns whether a lease was removed.
    async fn release(&self, node_id: &str, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Lease>>;
}

/// Lease store for a single process
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: DashMap<String, Lease>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn reserve(&self, node_id: &str, key: &str, ttl: Duration) -> Result<Lease> {
        let now = clock::now_ms();
        let lease = Lease {
            key: key.to_string(),
            owner: node_id.to_string(),
            expires_at: now + ttl.as_millis() as u64,
        };

        // The entry holds the shard lock, so check and write are one step
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.owner != node_id && current.is_live(now) {
                    return Err(Error::ReservationConflict {
                        key: key.to_string(),
                        owner: current.owner.clone(),
                    });
                }
                entry.insert(lease.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(lease.clone());
            }
        }

        Ok(lease)
    }

    async fn release(&self, node_id: &str, key: &str) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.owner == node_id)
            .is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>> {
        Ok(self.leases.get(key).map(|lease| lease.value().clone()))
    }
}

/// Grants and renews document leases with a fixed TTL
pub struct ReservationManager {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire or renew the lease on `key` for `node_id`
    pub async fn reserve(&self, node_id: &str, key: &DocumentKey) -> Result<Lease> {
        match self.store.reserve(node_id, &key.to_string(), self.ttl).await {
            Ok(lease) => {
                debug!(node = node_id, document = %key, expires_at = lease.expires_at, "Lease granted");
                Ok(lease)
            }
            Err(e) => {
                debug!(node = node_id, document = %key, error = %e, "Lease refused");
                Err(e)
            }
        }
    }

    /// Renewal is a reserve by the current holder
    pub async fn renew(&self, node_id: &str, key: &DocumentKey) -> Result<Lease> {
        self.reserve(node_id, key).await
    }

    pub async fn release(&self, node_id: &str, key: &DocumentKey) -> Result<bool> {
        let released = self.store.release(node_id, &key.to_string()).await?;
        if released {
            info!(node = node_id, document = %key, "Lease released");
        }
        Ok(released)
    }

    /// Current holder of `key`, if its lease is live
    pub async fn owner(&self, key: &DocumentKey) -> Result<Option<String>> {
        let now = clock::now_ms();
        Ok(self
            .store
            .get(&key.to_string())
            .await?
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::new("t1", "doc1").unwrap()
    }

    fn manager(ttl_ms: u64) -> ReservationManager {
        ReservationManager::new(Arc::new(MemoryLeaseStore::new()), Duration::from_millis(ttl_ms))
    }

    #[tokio::test]
    async fn test_conflict_until_expiry() {
        let reservations = manager(50);

        let lease = reservations.reserve("nodeX", &key()).await.unwrap();
        assert_eq!(lease.owner, "nodeX");

        let err = reservations.reserve("nodeY", &key()).await.unwrap_err();
        assert!(matches!(err, Error::ReservationConflict { ref owner, .. } if owner == "nodeX"));

        tokio::time::sleep(Duration::from_millis(80)).await;

        let lease = reservations.reserve("nodeY", &key()).await.unwrap();
        assert_eq!(lease.owner, "nodeY");
        assert_eq!(reservations.owner(&key()).await.unwrap().as_deref(), Some("nodeY"));
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let reservations = manager(60_000);

        let first = reservations.reserve("nodeX", &key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let renewed = reservations.renew("nodeX", &key()).await.unwrap();
        assert!(renewed.expires_at >= first.expires_at);
    }

    #[tokio::test]
    async fn test_exactly_one_concurrent_reserve_wins() {
        let reservations = Arc::new(manager(60_000));

        let mut handles = Vec::new();
        for i in 0..16 {
            let reservations = reservations.clone();
            handles.push(tokio::spawn(async move {
                reservations.reserve(&format!("node{}", i), &key()).await
            }));
        }

        let mut granted = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(Error::ReservationConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let reservations = manager(60_000);
        reservations.reserve("nodeX", &key()).await.unwrap();

        assert!(!reservations.release("nodeY", &key()).await.unwrap());
        assert!(reservations.release("nodeX", &key()).await.unwrap());
        assert!(reservations.owner(&key()).await.unwrap().is_none());

        assert!(reservations.reserve("nodeY", &key()).await.is_ok());
    }
}
