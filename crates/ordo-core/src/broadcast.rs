//! In-process broadcast groups

use crate::error::Result;
use crate::message::SequencedOperationMessage;
use crate::socket::Socket;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

/// Shared handle to a message delivered to a group
pub type Envelope = Arc<SequencedOperationMessage>;

const DEFAULT_GROUP_CAPACITY: usize = 1024;

/// Registry of named broadcast groups
pub struct BroadcastHub {
    groups: DashMap<String, broadcast::Sender<Envelope>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GROUP_CAPACITY)
    }

    /// Create a hub whose groups buffer up to `capacity` messages per receiver
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            groups: DashMap::new(),
            capacity,
        }
    }

    /// Receive everything published to `group` from now on
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Envelope> {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a group; returns the number of receivers reached
    pub fn publish(&self, group: &str, message: Envelope) -> usize {
        match self.groups.get(group) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop groups nobody listens to; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, sender| sender.receiver_count() > 0);
        before - self.groups.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket that forwards traffic of every joined group into one queue.
///
/// A subscriber that falls behind a group's buffer has missed sequenced
/// messages, so the queue is closed rather than left with a gap.
pub struct HubSocket {
    hub: Arc<BroadcastHub>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    groups: Mutex<Vec<String>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl HubSocket {
    /// Create a socket and the queue its groups feed
    pub fn new(hub: Arc<BroadcastHub>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let socket = Self {
            hub,
            sender: Arc::new(Mutex::new(Some(sender))),
            groups: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        };
        (socket, receiver)
    }

    /// Groups joined so far
    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().clone()
    }

    /// True once the queue was closed after a lag
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop forwarding every joined group
    pub fn leave_all(&self) {
        self.groups.lock().clear();
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Socket for HubSocket {
    async fn join(&self, group: &str) -> Result<()> {
        {
            let mut groups = self.groups.lock();
            if groups.iter().any(|g| g == group) {
                return Ok(());
            }
            groups.push(group.to_string());
        }

        let mut receiver = self.hub.subscribe(group);
        let sender = self.sender.clone();
        let name = group.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let forward = sender.lock().clone();
                        match forward {
                            Some(forward) if forward.send(message).is_ok() => {}
                            _ => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(group = %name, missed = n, "Socket lagged behind group, closing it");
                        sender.lock().take();
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().push(handle);

        Ok(())
    }
}

impl Drop for HubSocket {
    fn drop(&mut self) {
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
    }
}
