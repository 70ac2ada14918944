//! Sequencing: assigning each raw message its position in a document

use crate::broadcast::BroadcastHub;
use crate::error::{Error, Result};
use crate::key::DocumentKey;
use crate::message::{Contents, RawOperationMessage, SequencedOperationMessage, Trace};
use crate::producer::LogRecord;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Service name recorded on the trace added at sequencing time
pub const SEQUENCER_SERVICE: &str = "sequencer";

/// Ordering state of a single document
#[derive(Debug)]
pub struct DocumentSequencer {
    key: DocumentKey,
    sequence_number: u64,
    clients: HashSet<String>,
}

impl DocumentSequencer {
    pub fn new(key: DocumentKey) -> Self {
        Self {
            key,
            sequence_number: 0,
            clients: HashSet::new(),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Last assigned sequence number (0 before the first message)
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn is_joined(&self, client_id: &str) -> bool {
        self.clients.contains(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Assign the next position to `message`.
    ///
    /// Rejected messages do not consume a sequence number.
    pub fn sequence(&mut self, message: RawOperationMessage) -> Result<SequencedOperationMessage> {
        message.validate()?;

        if message.tenant_id != self.key.tenant_id() || message.document_id != self.key.document_id() {
            return Err(Error::MalformedMessage(format!(
                "message for {}/{} routed to {}",
                message.tenant_id, message.document_id, self.key
            )));
        }

        match &message.operation.contents {
            Contents::Join(join) => {
                if !self.clients.insert(join.client_id.clone()) {
                    return Err(Error::MalformedMessage(format!(
                        "duplicate join for client {}",
                        join.client_id
                    )));
                }
            }
            Contents::Leave(client_id) => {
                if !self.clients.remove(client_id) {
                    return Err(Error::MalformedMessage(format!(
                        "leave for unknown client {}",
                        client_id
                    )));
                }
            }
            Contents::Edit(_) => {
                let client_id = message.client_id.as_deref().unwrap_or_default();
                if !self.clients.contains(client_id) {
                    return Err(Error::MalformedMessage(format!(
                        "op from client {} that has not joined",
                        client_id
                    )));
                }
            }
        }

        self.sequence_number += 1;

        let RawOperationMessage {
            client_id,
            timestamp,
            mut operation,
            ..
        } = message;
        operation.traces.push(Trace::now("end", SEQUENCER_SERVICE));

        Ok(SequencedOperationMessage {
            tenant_id: self.key.tenant_id().to_string(),
            document_id: self.key.document_id().to_string(),
            client_id,
            sequence_number: self.sequence_number,
            timestamp,
            operation,
        })
    }
}

/// Send a sequenced message to its document's broadcast group
pub fn publish(hub: &BroadcastHub, message: SequencedOperationMessage) -> Arc<SequencedOperationMessage> {
    let message = Arc::new(message);
    let group = format!("{}/{}", message.tenant_id, message.document_id);
    let receivers = hub.publish(&group, message.clone());
    debug!(group = %group, seq = message.sequence_number, receivers, "Published sequenced message");
    message
}

/// Consumer side of the log: sequences every record and republishes it
pub struct Sequencer {
    documents: DashMap<String, Arc<Mutex<DocumentSequencer>>>,
    /// Next unconsumed offset per partition
    offsets: DashMap<String, u64>,
    hub: Arc<BroadcastHub>,
}

impl Sequencer {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            documents: DashMap::new(),
            offsets: DashMap::new(),
            hub,
        }
    }

    /// Sequence a log record unless its offset was already consumed.
    /// Lets a replay of stored records overlap with the live tail.
    pub fn process_record(&self, record: &LogRecord) -> Option<Arc<SequencedOperationMessage>> {
        {
            let mut next = self.offsets.entry(record.partition_key.clone()).or_insert(0);
            if record.offset < *next {
                debug!(partition = %record.partition_key, offset = record.offset, "Skipping consumed record");
                return None;
            }
            if record.offset > *next {
                warn!(
                    partition = %record.partition_key,
                    expected = *next,
                    offset = record.offset,
                    "Gap in log partition"
                );
            }
            *next = record.offset + 1;
        }
        self.process(&record.payload)
    }

    /// Sequence one log payload. Malformed or out-of-protocol messages are
    /// logged and dropped.
    pub fn process(&self, payload: &[u8]) -> Option<Arc<SequencedOperationMessage>> {
        let message = match RawOperationMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Dropping undecodable log record");
                return None;
            }
        };

        let key = match message.key() {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Dropping log record with invalid document key");
                return None;
            }
        };

        let document = self
            .documents
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentSequencer::new(key.clone()))))
            .value()
            .clone();

        let sequenced = document.lock().sequence(message);
        match sequenced {
            Ok(sequenced) => Some(publish(&self.hub, sequenced)),
            Err(e) => {
                error!(document = %key, error = %e, "Dropping message rejected by sequencer");
                None
            }
        }
    }

    /// Last sequence number assigned for a document
    pub fn sequence_number(&self, key: &DocumentKey) -> Option<u64> {
        self.documents
            .get(&key.to_string())
            .map(|d| d.value().lock().sequence_number())
    }

    /// Drain a log tail until it closes
    pub async fn run(self: Arc<Self>, mut records: mpsc::UnboundedReceiver<LogRecord>) {
        info!("Sequencer consuming log");
        while let Some(record) = records.recv().await {
            self.process_record(&record);
        }
        info!("Log tail closed, sequencer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientJoin, Operation};
    use crate::socket::{document_group, Socket};
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::new("t1", "doc1").unwrap()
    }

    fn join(client: &str) -> RawOperationMessage {
        RawOperationMessage::new(
            &key(),
            None,
            json!({}),
            Operation::join(ClientJoin { client_id: client.into(), detail: json!({}) }),
        )
    }

    fn op(client: &str, csn: i64) -> RawOperationMessage {
        RawOperationMessage::new(&key(), Some(client.into()), json!({}), Operation::edit(csn, 0, json!({"n": csn})))
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut seq = DocumentSequencer::new(key());

        assert_eq!(seq.sequence(join("a")).unwrap().sequence_number, 1);
        assert_eq!(seq.sequence(op("a", 1)).unwrap().sequence_number, 2);
        assert_eq!(seq.sequence(op("a", 2)).unwrap().sequence_number, 3);
        assert_eq!(seq.sequence_number(), 3);
    }

    #[test]
    fn test_op_before_join_is_rejected() {
        let mut seq = DocumentSequencer::new(key());

        assert!(seq.sequence(op("ghost", 1)).is_err());
        assert_eq!(seq.sequence_number(), 0);
    }

    #[test]
    fn test_leave_removes_client() {
        let mut seq = DocumentSequencer::new(key());
        seq.sequence(join("a")).unwrap();

        let leave = RawOperationMessage::new(&key(), None, json!({}), Operation::leave("a"));
        let sequenced = seq.sequence(leave.clone()).unwrap();
        assert_eq!(sequenced.operation.contents, Contents::Leave("a".into()));
        assert!(!seq.is_joined("a"));

        // A second leave is out of protocol
        assert!(seq.sequence(leave).is_err());
        assert!(seq.sequence(op("a", 3)).is_err());
    }

    #[test]
    fn test_sequenced_copy_gets_end_trace() {
        let mut seq = DocumentSequencer::new(key());
        let sequenced = seq.sequence(join("a")).unwrap();
        let last = sequenced.operation.traces.last().unwrap();
        assert_eq!(last.action, "end");
        assert_eq!(last.service, SEQUENCER_SERVICE);
    }

    #[test]
    fn test_wrong_document_is_rejected() {
        let mut seq = DocumentSequencer::new(DocumentKey::new("t1", "other").unwrap());
        assert!(seq.sequence(join("a")).is_err());
    }

    #[tokio::test]
    async fn test_process_publishes_and_drops_garbage() {
        let hub = Arc::new(BroadcastHub::new());
        let sequencer = Sequencer::new(hub.clone());
        let (socket, mut rx) = crate::broadcast::HubSocket::new(hub.clone());
        socket.join(&document_group(&key())).await.unwrap();

        assert!(sequencer.process(b"not json").is_none());
        let sequenced = sequencer.process(&join("a").encode().unwrap()).unwrap();
        assert_eq!(sequenced.sequence_number, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.sequence_number, 1);
        assert_eq!(sequencer.sequence_number(&key()), Some(1));
    }

    #[test]
    fn test_replayed_offsets_are_skipped() {
        let sequencer = Sequencer::new(Arc::new(BroadcastHub::new()));
        let record = |offset, message: RawOperationMessage| LogRecord {
            partition_key: "doc1".into(),
            offset,
            payload: message.encode().unwrap(),
        };

        let join = record(0, join("a"));
        let edit = record(1, op("a", 1));
        assert!(sequencer.process_record(&join).is_some());
        assert!(sequencer.process_record(&edit).is_some());

        // The live tail redelivers what a replay already covered
        assert!(sequencer.process_record(&join).is_none());
        assert!(sequencer.process_record(&edit).is_none());
        assert_eq!(sequencer.sequence_number(&key()), Some(2));
    }
}
