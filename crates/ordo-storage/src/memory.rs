//! In-memory storage backend

use crate::StorageStats;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ordo_core::clock;
use ordo_core::{
    DocumentDetails, DocumentKey, DocumentRecord, DocumentStorage, Error, LogRecord, Producer,
    Result,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// In-memory partitioned log
///
/// Every partition is an append-only vector; offsets are vector indices.
/// Tails opened with [`MemoryLog::subscribe`] see every record appended
/// after they were opened, in per-partition append order.
/// Data is lost when the process exits.
pub struct MemoryLog {
    partitions: DashMap<String, Vec<Bytes>>,
    tails: Mutex<Vec<mpsc::UnboundedSender<LogRecord>>>,
    closed: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            tails: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a live tail over all partitions
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.tails.lock().push(sender);
        }
        receiver
    }

    /// Records of one partition starting at `offset`
    pub fn read(&self, partition_key: &str, offset: u64) -> Vec<LogRecord> {
        let Some(partition) = self.partitions.get(partition_key) else {
            return Vec::new();
        };
        partition
            .iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(i, payload)| LogRecord {
                partition_key: partition_key.to_string(),
                offset: i as u64,
                payload: payload.clone(),
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: 0,
            partition_count: self.partitions.len(),
            record_count: self.partitions.iter().map(|p| p.value().len()).sum(),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Producer for MemoryLog {
    async fn send(&self, message: Bytes, partition_key: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LogAppend("log is closed".into()));
        }

        // Tails are fed under the partition lock so they observe append order
        let mut partition = self.partitions.entry(partition_key.to_string()).or_default();
        let record = LogRecord {
            partition_key: partition_key.to_string(),
            offset: partition.len() as u64,
            payload: message.clone(),
        };
        partition.push(message);

        let mut tails = self.tails.lock();
        tails.retain(|tail| tail.send(record.clone()).is_ok());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut tails = self.tails.lock();
            let n = tails.len();
            tails.clear();
            n
        };
        debug!(tails = dropped, "Memory log closed");
        Ok(())
    }
}

/// In-memory document metadata
#[derive(Default)]
pub struct MemoryDocumentStorage {
    documents: DashMap<String, DocumentRecord>,
}

impl MemoryDocumentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` as a branch of `parent`. Fails if the document exists.
    pub fn create_branch(&self, key: &DocumentKey, parent: &DocumentKey) -> Result<DocumentRecord> {
        match self.documents.entry(key.to_string()) {
            Entry::Occupied(_) => Err(Error::Storage(format!("document {} already exists", key))),
            Entry::Vacant(entry) => {
                let record = DocumentRecord {
                    tenant_id: key.tenant_id().to_string(),
                    document_id: key.document_id().to_string(),
                    parent_branch: Some(parent.document_id().to_string()),
                    created_at: clock::now_ms(),
                };
                entry.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStorage for MemoryDocumentStorage {
    async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails> {
        match self.documents.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(DocumentDetails {
                existing: true,
                value: entry.get().clone(),
            }),
            Entry::Vacant(entry) => {
                let record = DocumentRecord {
                    tenant_id: key.tenant_id().to_string(),
                    document_id: key.document_id().to_string(),
                    parent_branch: None,
                    created_at: clock::now_ms(),
                };
                entry.insert(record.clone());
                debug!(document = %key, "Created document record");
                Ok(DocumentDetails {
                    existing: false,
                    value: record,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::{
        BroadcastHub, Contents, HubSocket, LogOrdererFactory, MessageType, Operation, Orderer,
        OrdererConnection, Sequencer, Socket,
    };
    use std::collections::HashMap;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn key() -> DocumentKey {
        DocumentKey::new("acme", "notes").unwrap()
    }

    #[tokio::test]
    async fn test_offsets_follow_append_order() {
        let log = MemoryLog::new();
        let mut tail = log.subscribe();

        log.send(Bytes::from_static(b"a"), "p1").await.unwrap();
        log.send(Bytes::from_static(b"b"), "p2").await.unwrap();
        log.send(Bytes::from_static(b"c"), "p1").await.unwrap();

        let first = tail.recv().await.unwrap();
        let second = tail.recv().await.unwrap();
        let third = tail.recv().await.unwrap();
        assert_eq!((first.partition_key.as_str(), first.offset), ("p1", 0));
        assert_eq!((second.partition_key.as_str(), second.offset), ("p2", 0));
        assert_eq!((third.partition_key.as_str(), third.offset), ("p1", 1));

        let replay = log.read("p1", 1);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].payload, Bytes::from_static(b"c"));
        assert_eq!(log.stats().record_count, 3);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_appends_and_ends_tails() {
        let log = MemoryLog::new();
        let mut tail = log.subscribe();

        log.close().await.unwrap();
        assert!(tail.recv().await.is_none());

        let err = log.send(Bytes::from_static(b"x"), "p").await.unwrap_err();
        assert!(matches!(err, Error::LogAppend(_)));
    }

    #[tokio::test]
    async fn test_get_or_create_reports_existing() {
        let storage = MemoryDocumentStorage::new();

        let first = storage.get_or_create_document(&key()).await.unwrap();
        assert!(!first.existing);
        assert_eq!(first.value.document_id, "notes");

        let second = storage.get_or_create_document(&key()).await.unwrap();
        assert!(second.existing);
        assert_eq!(second.value, first.value);
    }

    #[tokio::test]
    async fn test_branch_records_parent() {
        let storage = MemoryDocumentStorage::new();
        let branch = DocumentKey::new("acme", "notes-draft").unwrap();

        storage.create_branch(&branch, &key()).unwrap();
        let details = storage.get_or_create_document(&branch).await.unwrap();
        assert!(details.existing);
        assert_eq!(details.parent_branch(), Some("notes"));

        assert!(storage.create_branch(&branch, &key()).is_err());
    }

    #[tokio::test]
    async fn test_log_path_round_trip() {
        let log = Arc::new(MemoryLog::new());
        let hub = Arc::new(BroadcastHub::new());
        let sequencer = Arc::new(Sequencer::new(hub.clone()));
        tokio::spawn(sequencer.clone().run(log.subscribe()));

        let factory = LogOrdererFactory::new(log.clone(), Arc::new(MemoryDocumentStorage::new()), "test");
        let orderer = factory.create(&key()).await.unwrap();

        let (socket, mut pushed) = HubSocket::new(hub.clone());
        let connection = orderer
            .connect(&socket, json!({"name": "ada"}), json!({"mode": "write"}))
            .await
            .unwrap();
        let client_id = connection.client_id().to_string();

        connection.submit(Operation::edit(1, 1, json!({"insert": "hello"}))).await.unwrap();
        connection.submit(Operation::edit(2, 2, json!({"insert": "world"}))).await.unwrap();
        connection.disconnect().await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            let message = tokio::time::timeout(Duration::from_secs(2), pushed.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(message);
        }

        let types: Vec<_> = received.iter().map(|m| m.operation.contents.message_type()).collect();
        assert_eq!(
            types,
            vec![MessageType::Join, MessageType::Op, MessageType::Op, MessageType::Leave]
        );

        let numbers: Vec<_> = received.iter().map(|m| m.sequence_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);

        assert_eq!(received[1].operation.contents, Contents::Edit(json!({"insert": "hello"})));
        assert_eq!(received[2].client_id.as_deref(), Some(client_id.as_str()));
        assert_eq!(received[3].operation.contents, Contents::Leave(client_id));

        // Everything went through one partition
        assert_eq!(log.read("notes", 0).len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_keep_per_client_order() {
        const CLIENTS: usize = 6;
        const OPS: i64 = 12;

        let log = Arc::new(MemoryLog::new());
        let hub = Arc::new(BroadcastHub::new());
        let sequencer = Arc::new(Sequencer::new(hub.clone()));
        tokio::spawn(sequencer.clone().run(log.subscribe()));

        let (observer, mut pushed) = HubSocket::new(hub.clone());
        observer.join(&key().to_string()).await.unwrap();

        let factory = Arc::new(LogOrdererFactory::new(log.clone(), Arc::new(MemoryDocumentStorage::new()), "test"));
        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            let factory = factory.clone();
            let hub = hub.clone();
            clients.push(tokio::spawn(async move {
                let orderer = factory.create(&key()).await.unwrap();
                let (socket, _rx) = HubSocket::new(hub);
                let connection = orderer.connect(&socket, json!({}), json!({})).await.unwrap();
                for csn in 1..=OPS {
                    connection.submit(Operation::edit(csn, 0, json!({"n": csn}))).await.unwrap();
                    tokio::task::yield_now().await;
                }
                connection.disconnect().await.unwrap();
                connection.client_id().to_string()
            }));
        }

        let mut ids = Vec::new();
        for client in clients {
            ids.push(client.await.unwrap());
        }

        let total = CLIENTS * (OPS as usize + 2);
        let mut received = Vec::new();
        for _ in 0..total {
            let message = tokio::time::timeout(Duration::from_secs(5), pushed.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(message);
        }

        // One gap-free run of sequence numbers across every client
        let numbers: Vec<u64> = received.iter().map(|m| m.sequence_number).collect();
        assert_eq!(numbers, (1..=total as u64).collect::<Vec<_>>());

        // Per client: Join, then its edits in submit order, then Leave
        let mut per_client: HashMap<String, Vec<(MessageType, i64)>> = HashMap::new();
        for message in &received {
            let client = match &message.operation.contents {
                Contents::Join(join) => join.client_id.clone(),
                Contents::Leave(client) => client.clone(),
                Contents::Edit(_) => message.client_id.clone().unwrap(),
            };
            per_client.entry(client).or_default().push((
                message.operation.contents.message_type(),
                message.operation.client_sequence_number,
            ));
        }

        assert_eq!(per_client.len(), CLIENTS);
        for id in &ids {
            let history = &per_client[id];
            assert_eq!(history.len(), OPS as usize + 2);
            assert_eq!(history.first().unwrap().0, MessageType::Join);
            assert_eq!(history.last().unwrap().0, MessageType::Leave);
            let edits: Vec<i64> = history[1..history.len() - 1]
                .iter()
                .map(|(kind, csn)| {
                    assert_eq!(*kind, MessageType::Op);
                    *csn
                })
                .collect();
            assert_eq!(edits, (1..=OPS).collect::<Vec<_>>());
        }

        assert_eq!(log.read("notes", 0).len(), total);
    }
}
