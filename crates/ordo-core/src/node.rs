//! Fleet membership through heartbeats

use crate::clock;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A fleet member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub address: String,
    /// Unix milliseconds of the last heartbeat
    pub last_heartbeat_at: u64,
}

impl Node {
    pub fn is_alive(&self, now_ms: u64, grace: Duration) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_at) <= grace.as_millis() as u64
    }
}

/// Shared table of fleet members
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn upsert(&self, node: Node) -> Result<()>;

    async fn get(&self, node_id: &str) -> Result<Option<Node>>;

    async fn list(&self) -> Result<Vec<Node>>;
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: DashMap<String, Node>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn upsert(&self, node: Node) -> Result<()> {
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(self.nodes.get(node_id).map(|n| n.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.iter().map(|n| n.value().clone()).collect())
    }
}

/// Records this node's heartbeat and answers liveness questions.
///
/// Dead nodes are never evicted here. Their leases simply expire.
pub struct NodeManager {
    node_id: String,
    address: String,
    store: Arc<dyn NodeStore>,
    grace: Duration,
}

impl NodeManager {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, store: Arc<dyn NodeStore>, grace: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            store,
            grace,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn heartbeat(&self) -> Result<Node> {
        let node = Node {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            last_heartbeat_at: clock::now_ms(),
        };
        self.store.upsert(node.clone()).await?;
        debug!(node = %self.node_id, "Heartbeat recorded");
        Ok(node)
    }

    pub async fn is_alive(&self, node_id: &str) -> Result<bool> {
        let now = clock::now_ms();
        Ok(self
            .store
            .get(node_id)
            .await?
            .map_or(false, |node| node.is_alive(now, self.grace)))
    }

    /// Whether this node's own heartbeat is current
    pub async fn is_self_alive(&self) -> Result<bool> {
        self.is_alive(&self.node_id).await
    }

    pub async fn live_nodes(&self) -> Result<Vec<Node>> {
        let now = clock::now_ms();
        let mut nodes: Vec<Node> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|node| node.is_alive(now, self.grace))
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    /// Heartbeat every `interval` until the task is dropped
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.heartbeat().await {
                warn!(node = %self.node_id, error = %e, "Heartbeat failed");
            }
        }
    }
}
