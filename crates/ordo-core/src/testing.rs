//! Test doubles for collaborators

use crate::clock;
use crate::error::{Error, Result};
use crate::key::DocumentKey;
use crate::message::RawOperationMessage;
use crate::producer::Producer;
use crate::reservation::{Lease, LeaseStore, MemoryLeaseStore};
use crate::socket::Socket;
use crate::storage::{DocumentDetails, DocumentRecord, DocumentStorage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Producer that keeps every appended record in arrival order
#[derive(Default)]
pub struct RecordingProducer {
    records: Mutex<Vec<(String, Bytes)>>,
    failing: AtomicBool,
}

impl RecordingProducer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<RawOperationMessage> {
        self.records
            .lock()
            .iter()
            .map(|(_, payload)| RawOperationMessage::decode(payload).unwrap())
            .collect()
    }

    pub fn partition_keys(&self) -> Vec<String> {
        self.records.lock().iter().map(|(key, _)| key.clone()).collect()
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn send(&self, message: Bytes, partition_key: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::LogAppend("broker unavailable".into()));
        }
        self.records.lock().push((partition_key.to_string(), message));
        Ok(())
    }
}

/// Storage that fails the first `failures` calls and can be slowed down
pub struct FlakyStorage {
    failures: AtomicUsize,
    calls: AtomicUsize,
    delay: Duration,
    known: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    pub fn new(failures: usize) -> Self {
        Self::with_delay(failures, Duration::ZERO)
    }

    pub fn with_delay(failures: usize, delay: Duration) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            delay,
            known: Mutex::new(HashSet::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStorage for FlakyStorage {
    async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Storage("metadata store unreachable".into()));
        }

        let existing = !self.known.lock().insert(key.to_string());
        Ok(DocumentDetails {
            existing,
            value: DocumentRecord {
                tenant_id: key.tenant_id().to_string(),
                document_id: key.document_id().to_string(),
                parent_branch: None,
                created_at: clock::now_ms(),
            },
        })
    }
}

/// Socket that only remembers which groups it joined
#[derive(Default)]
pub struct RecordingSocket {
    groups: Mutex<Vec<String>>,
}

impl RecordingSocket {
    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().clone()
    }
}

#[async_trait]
impl Socket for RecordingSocket {
    async fn join(&self, group: &str) -> Result<()> {
        self.groups.lock().push(group.to_string());
        Ok(())
    }
}

/// Lease store whose releases always fail
#[derive(Default)]
pub struct StuckLeaseStore {
    inner: MemoryLeaseStore,
    release_attempts: AtomicUsize,
}

impl StuckLeaseStore {
    pub fn release_attempts(&self) -> usize {
        self.release_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for StuckLeaseStore {
    async fn reserve(&self, node_id: &str, key: &str, ttl: Duration) -> Result<Lease> {
        self.inner.reserve(node_id, key, ttl).await
    }

    async fn release(&self, _node_id: &str, _key: &str) -> Result<bool> {
        self.release_attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Storage("lease table locked".into()))
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>> {
        self.inner.get(key).await
    }
}
