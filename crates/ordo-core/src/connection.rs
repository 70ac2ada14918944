//! Client connections against an orderer

use crate::error::{Error, Result};
use crate::key::DocumentKey;
use crate::message::{ClientJoin, Operation, RawOperationMessage, Trace};
use crate::producer::Producer;
use crate::socket::{client_group, document_group, Socket};
use crate::storage::DocumentRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One client's live session on one document
#[async_trait]
pub trait OrdererConnection: Send + Sync {
    fn client_id(&self) -> &str;

    fn key(&self) -> &DocumentKey;

    /// Whether the document existed when this connection was made
    fn existing(&self) -> bool;

    fn parent_branch(&self) -> Option<&str>;

    /// Submit a client edit for ordering. Control contents are rejected.
    async fn submit(&self, operation: Operation) -> Result<()>;

    /// Announce the client's departure
    async fn disconnect(&self) -> Result<()>;
}

/// Identity of a connected client and the messages it mints
#[derive(Debug, Clone)]
pub(crate) struct ClientSession {
    pub key: DocumentKey,
    pub client_id: String,
    pub user: serde_json::Value,
    pub ingress: String,
}

impl ClientSession {
    pub fn new(key: DocumentKey, user: serde_json::Value, ingress: &str) -> Self {
        Self {
            key,
            client_id: Uuid::new_v4().to_string(),
            user,
            ingress: ingress.to_string(),
        }
    }

    /// Join both broadcast groups of this client
    pub async fn join_groups(&self, socket: &dyn Socket) -> Result<()> {
        socket.join(&document_group(&self.key)).await?;
        socket.join(&client_group(&self.client_id)).await
    }

    pub fn join_message(&self, detail: serde_json::Value) -> RawOperationMessage {
        let join = ClientJoin {
            client_id: self.client_id.clone(),
            detail,
        };
        self.stamp(RawOperationMessage::new(&self.key, None, self.user.clone(), Operation::join(join)))
    }

    pub fn leave_message(&self) -> RawOperationMessage {
        self.stamp(RawOperationMessage::new(
            &self.key,
            None,
            self.user.clone(),
            Operation::leave(self.client_id.clone()),
        ))
    }

    pub fn op_message(&self, operation: Operation) -> Result<RawOperationMessage> {
        if operation.is_control() {
            return Err(Error::MalformedMessage(format!(
                "clients cannot submit {} messages",
                operation.message_type()
            )));
        }
        operation.validate()?;

        Ok(self.stamp(RawOperationMessage::new(
            &self.key,
            Some(self.client_id.clone()),
            self.user.clone(),
            operation,
        )))
    }

    // Last mutation before the message leaves this process
    fn stamp(&self, mut message: RawOperationMessage) -> RawOperationMessage {
        message.operation.traces.push(Trace::now("start", self.ingress.clone()));
        message
    }
}

/// Connection whose messages are ordered by the shared log
pub struct LogOrdererConnection {
    session: ClientSession,
    existing: bool,
    parent_branch: Option<String>,
    producer: Arc<dyn Producer>,
    left: AtomicBool,
}

impl LogOrdererConnection {
    /// Create a connection: pick a client id, join the document and client
    /// groups, and append the Join control message. The Join is in the log
    /// before this returns, so it precedes every later message of the client.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        existing: bool,
        document: &DocumentRecord,
        producer: Arc<dyn Producer>,
        key: DocumentKey,
        socket: &dyn Socket,
        user: serde_json::Value,
        client: serde_json::Value,
        ingress: &str,
    ) -> Result<Self> {
        let session = ClientSession::new(key, user, ingress);
        session.join_groups(socket).await?;

        let connection = Self {
            existing,
            parent_branch: document.parent_branch.clone(),
            producer,
            session,
            left: AtomicBool::new(false),
        };

        let join = connection.session.join_message(client);
        connection.send(join).await?;

        info!(
            document = %connection.session.key,
            client = %connection.session.client_id,
            existing,
            "Client joined log-ordered document"
        );
        Ok(connection)
    }

    async fn send(&self, message: RawOperationMessage) -> Result<()> {
        let payload = message.encode()?;
        self.producer
            .send(payload, self.session.key.partition_key())
            .await
    }
}

#[async_trait]
impl OrdererConnection for LogOrdererConnection {
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
        debug!(client = %self.session.client_id, csn = message.operation.client_sequence_number, "Submitting op");
        self.send(message).await
    }

    async fn disconnect(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(document = %self.session.key, client = %self.session.client_id, "Client leaving");
        if let Err(e) = self.send(self.session.leave_message()).await {
            // Not in the log, so a later disconnect may try again
            self.left.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}
