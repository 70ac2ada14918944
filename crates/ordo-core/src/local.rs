//! In-process ordering for documents this node holds the lease on

use crate::broadcast::BroadcastHub;
use crate::clock;
use crate::connection::{ClientSession, OrdererConnection};
use crate::error::{Error, Result};
use crate::key::DocumentKey;
use crate::message::{Operation, RawOperationMessage};
use crate::node::NodeManager;
use crate::orderer::Orderer;
use crate::reservation::{Lease, ReservationManager};
use crate::sequencer::{self, DocumentSequencer};
use crate::socket::Socket;
use crate::storage::{DocumentDetails, DocumentStorage};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Ordering state shared by a local orderer and its connections
struct LocalDocument {
    key: DocumentKey,
    sequencer: Mutex<DocumentSequencer>,
    hub: Arc<BroadcastHub>,
    active: AtomicBool,
    lease_expires_at: AtomicU64,
    connections: AtomicUsize,
}

impl LocalDocument {
    /// Ownership is trusted only until the last renewed expiry
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && clock::now_ms() < self.lease_expires_at.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn sequence(&self, message: RawOperationMessage) -> Result<u64> {
        if !self.is_active() {
            return Err(Error::LeaseLost(self.key.to_string()));
        }
        // Publish under the lock so subscribers see sequence order
        let mut state = self.sequencer.lock();
        let sequenced = state.sequence(message)?;
        let sequence_number = sequenced.sequence_number;
        sequencer::publish(&self.hub, sequenced);
        Ok(sequence_number)
    }
}

/// Orderer that sequences in memory without a log hop
pub struct LocalOrderer {
    document: Arc<LocalDocument>,
    details: DocumentDetails,
    existing: AtomicBool,
    ingress: String,
}

impl std::fmt::Debug for LocalOrderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOrderer")
            .field("key", &self.document.key)
            .field("details", &self.details)
            .field("ingress", &self.ingress)
            .finish_non_exhaustive()
    }
}

impl LocalOrderer {
    fn new(key: DocumentKey, details: DocumentDetails, lease: &Lease, hub: Arc<BroadcastHub>, ingress: &str) -> Self {
        Self {
            document: Arc::new(LocalDocument {
                sequencer: Mutex::new(DocumentSequencer::new(key.clone())),
                key,
                hub,
                active: AtomicBool::new(true),
                lease_expires_at: AtomicU64::new(lease.expires_at),
                connections: AtomicUsize::new(0),
            }),
            existing: AtomicBool::new(details.existing),
            details,
            ingress: ingress.to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.document.is_active()
    }

    pub fn existing(&self) -> bool {
        self.existing.load(Ordering::SeqCst)
    }

    /// Last sequence number assigned locally
    pub fn sequence_number(&self) -> u64 {
        self.document.sequencer.lock().sequence_number()
    }

    pub fn connection_count(&self) -> usize {
        self.document.connections.load(Ordering::SeqCst)
    }

    fn renewed(&self, lease: &Lease) {
        self.document
            .lease_expires_at
            .store(lease.expires_at, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.document.deactivate();
    }
}

#[async_trait]
impl Orderer for LocalOrderer {
    fn key(&self) -> &DocumentKey {
        &self.document.key
    }

    async fn connect(
        &self,
        socket: &dyn Socket,
        user: serde_json::Value,
        client: serde_json::Value,
    ) -> Result<Box<dyn OrdererConnection>> {
        if !self.document.is_active() {
            return Err(Error::LeaseLost(self.document.key.to_string()));
        }

        let session = ClientSession::new(self.document.key.clone(), user, &self.ingress);
        session.join_groups(socket).await?;

        let sequence_number = self.document.sequence(session.join_message(client))?;
        self.document.connections.fetch_add(1, Ordering::SeqCst);

        let existing = self.existing.swap(true, Ordering::SeqCst);
        info!(
            document = %self.document.key,
            client = %session.client_id,
            seq = sequence_number,
            existing,
            "Client joined locally ordered document"
        );

        Ok(Box::new(LocalOrdererConnection {
            session,
            existing,
            parent_branch: self.details.value.parent_branch.clone(),
            document: self.document.clone(),
            left: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.deactivate();
        Ok(())
    }
}

/// Connection on a locally ordered document
pub struct LocalOrdererConnection {
    session: ClientSession,
    existing: bool,
    parent_branch: Option<String>,
    document: Arc<LocalDocument>,
    left: AtomicBool,
}

#[async_trait]
impl OrdererConnection for LocalOrdererConnection {
    fn client_id(&self) -> &str {
        &self.session.client_id
    }

    fn key(&self) -> &DocumentKey {
        &self.session.key
    }

    fn existing(&self) -> bool {
        self.existing
    }

    fn parent_branch(&self) -> Option<&str> {
        self.parent_branch.as_deref()
    }

    async fn submit(&self, operation: Operation) -> Result<()> {
        let message = self.session.op_message(operation)?;
        let seq = self.document.sequence(message)?;
        debug!(client = %self.session.client_id, seq, "Sequenced op locally");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.document.connections.fetch_sub(1, Ordering::SeqCst);
        self.document.sequence(self.session.leave_message())?;
        info!(document = %self.session.key, client = %self.session.client_id, "Client left locally ordered document");
        Ok(())
    }
}

/// Creates and tracks local orderers, one per leased document
pub struct LocalOrderManager {
    node: Arc<NodeManager>,
    reservations: Arc<ReservationManager>,
    storage: Arc<dyn DocumentStorage>,
    hub: Arc<BroadcastHub>,
    ingress: String,
    orderers: DashMap<String, Arc<OnceCell<Arc<LocalOrderer>>>>,
}

impl LocalOrderManager {
    pub fn new(
        node: Arc<NodeManager>,
        reservations: Arc<ReservationManager>,
        storage: Arc<dyn DocumentStorage>,
        hub: Arc<BroadcastHub>,
        ingress: &str,
    ) -> Self {
        Self {
            node,
            reservations,
            storage,
            hub,
            ingress: ingress.to_string(),
            orderers: DashMap::new(),
        }
    }

    /// Local orderer for `key`, acquiring the lease if needed.
    ///
    /// Fails with [`Error::NotLocal`] when this node is not live and with
    /// [`Error::ReservationConflict`] when another node holds the lease.
    pub async fn get_orderer(&self, key: &DocumentKey) -> Result<Arc<LocalOrderer>> {
        let id = key.to_string();

        if let Some(orderer) = self.get(key) {
            if orderer.is_active() {
                return Ok(orderer);
            }
            self.evict(&id, &orderer);
        }

        if !self.node.is_self_alive().await? {
            return Err(Error::NotLocal(id));
        }

        let cell = self
            .orderers
            .entry(id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let orderer = cell
            .get_or_try_init(|| async {
                let lease = self.reservations.reserve(self.node.node_id(), key).await?;
                let details = match self.storage.get_or_create_document(key).await {
                    Ok(details) => details,
                    Err(e) => {
                        // Do not sit on a lease we cannot use
                        self.release_or_warn(key).await;
                        return Err(e);
                    }
                };
                info!(node = %self.node.node_id(), document = %key, "Ordering document locally");
                Ok::<_, Error>(Arc::new(LocalOrderer::new(
                    key.clone(),
                    details,
                    &lease,
                    self.hub.clone(),
                    &self.ingress,
                )))
            })
            .await?
            .clone();

        if orderer.is_active() {
            Ok(orderer)
        } else {
            self.evict(&id, &orderer);
            Err(Error::LeaseLost(id))
        }
    }

    pub fn get(&self, key: &DocumentKey) -> Option<Arc<LocalOrderer>> {
        self.orderers
            .get(&key.to_string())
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Documents currently ordered here
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = self
            .orderers
            .iter()
            .filter(|entry| entry.value().get().map_or(false, |o| o.is_active()))
            .map(|entry| entry.key().clone())
            .collect();
        held.sort();
        held
    }

    /// Renew every held lease once. Documents whose renewal fails stop
    /// being ordered here.
    pub async fn renew_all(&self) -> usize {
        let mut lost = 0;

        for orderer in self.resolved() {
            let key = orderer.key().clone();
            match self.reservations.renew(self.node.node_id(), &key).await {
                Ok(lease) if orderer.is_active() => orderer.renewed(&lease),
                Ok(_) => {
                    // Expired before we got to it; the lease is ours again but
                    // clients already saw LeaseLost, so give it back
                    self.release_or_warn(&key).await;
                    self.evict(&key.to_string(), &orderer);
                    lost += 1;
                }
                Err(e) => {
                    warn!(node = %self.node.node_id(), document = %key, error = %e, "Lease lost");
                    self.evict(&key.to_string(), &orderer);
                    lost += 1;
                }
            }
        }

        lost
    }

    /// Renew leases every `interval` until the task is dropped
    pub async fn run_renewal(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let lost = self.renew_all().await;
            if lost > 0 {
                info!(lost, "Released documents after failed renewals");
            }
        }
    }

    /// Give up every lease, e.g. on shutdown
    pub async fn release_all(&self) -> Result<usize> {
        let mut released = 0;
        for orderer in self.resolved() {
            let key = orderer.key().clone();
            self.evict(&key.to_string(), &orderer);
            if self.reservations.release(self.node.node_id(), &key).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Give a lease back. A failure leaves it held until it expires.
    async fn release_or_warn(&self, key: &DocumentKey) -> bool {
        match self.reservations.release(self.node.node_id(), key).await {
            Ok(released) => released,
            Err(e) => {
                warn!(node = %self.node.node_id(), document = %key, error = %e, "Failed to release lease");
                false
            }
        }
    }

    fn resolved(&self) -> Vec<Arc<LocalOrderer>> {
        self.orderers
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    fn evict(&self, id: &str, orderer: &Arc<LocalOrderer>) {
        orderer.deactivate();
        self.orderers.remove_if(id, |_, cell| {
            cell.get().map_or(false, |current| Arc::ptr_eq(current, orderer))
        });
    }
}
