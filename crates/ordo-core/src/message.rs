//! Raw and sequenced operation messages
//!
//! Wire shape (JSON):
//!
//! ```text
//! { clientId, tenantId, documentId, type: "raw", user, timestamp,
//!   operation: { clientSequenceNumber, referenceSequenceNumber,
//!                type: "join" | "leave" | "op", contents, traces } }
//! ```
//!
//! Operation contents form a closed set. Join and Leave are control
//! messages and always carry `clientSequenceNumber = -1`; that value is
//! never valid for an edit. Decoding validates these rules, so anything
//! coming out of [`RawOperationMessage::decode`] is well formed.

use crate::clock;
use crate::error::{Error, Result};
use crate::key::DocumentKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client sequence number reserved for Join/Leave control messages
pub const CONTROL_CLIENT_SEQUENCE_NUMBER: i64 = -1;

/// Discriminator of a raw message envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    Raw,
}

/// Discriminator of operation contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Join,
    Leave,
    Op,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Join => write!(f, "join"),
            MessageType::Leave => write!(f, "leave"),
            MessageType::Op => write!(f, "op"),
        }
    }
}

/// Payload of a Join control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub client_id: String,
    /// Opaque client descriptor supplied at connect time
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Operation contents
#[derive(Debug, Clone, PartialEq)]
pub enum Contents {
    Join(ClientJoin),
    /// Id of the departing client
    Leave(String),
    /// Opaque edit payload, never interpreted here
    Edit(serde_json::Value),
}

impl Contents {
    pub fn message_type(&self) -> MessageType {
        match self {
            Contents::Join(_) => MessageType::Join,
            Contents::Leave(_) => MessageType::Leave,
            Contents::Edit(_) => MessageType::Op,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Contents::Edit(_))
    }

    /// Client a control message is about
    pub fn control_client_id(&self) -> Option<&str> {
        match self {
            Contents::Join(join) => Some(&join.client_id),
            Contents::Leave(client_id) => Some(client_id),
            Contents::Edit(_) => None,
        }
    }
}

/// Timing breadcrumb recorded as a message passes through services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub action: String,
    pub service: String,
    pub timestamp: f64,
}

impl Trace {
    pub fn now(action: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            service: service.into(),
            timestamp: clock::precise_ms(),
        }
    }
}

/// A client operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Operation {
    pub client_sequence_number: i64,
    pub reference_sequence_number: i64,
    pub contents: Contents,
    pub traces: Vec<Trace>,
}

impl Operation {
    pub fn join(join: ClientJoin) -> Self {
        Self::control(Contents::Join(join))
    }

    pub fn leave(client_id: impl Into<String>) -> Self {
        Self::control(Contents::Leave(client_id.into()))
    }

    pub fn edit(
        client_sequence_number: i64,
        reference_sequence_number: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            client_sequence_number,
            reference_sequence_number,
            contents: Contents::Edit(payload),
            traces: Vec::new(),
        }
    }

    fn control(contents: Contents) -> Self {
        Self {
            client_sequence_number: CONTROL_CLIENT_SEQUENCE_NUMBER,
            reference_sequence_number: -1,
            contents,
            traces: Vec::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.contents.message_type()
    }

    pub fn is_control(&self) -> bool {
        self.contents.is_control()
    }

    /// Check the control/edit sequence number rules
    pub fn validate(&self) -> Result<()> {
        match &self.contents {
            Contents::Join(_) | Contents::Leave(_) => {
                if self.client_sequence_number != CONTROL_CLIENT_SEQUENCE_NUMBER {
                    return Err(Error::MalformedMessage(format!(
                        "{} must carry clientSequenceNumber -1, got {}",
                        self.message_type(),
                        self.client_sequence_number
                    )));
                }
                match self.contents.control_client_id() {
                    Some(id) if !id.is_empty() => Ok(()),
                    _ => Err(Error::MalformedMessage(format!(
                        "{} without a clientId",
                        self.message_type()
                    ))),
                }
            }
            Contents::Edit(_) => {
                if self.client_sequence_number < 0 {
                    return Err(Error::MalformedMessage(format!(
                        "op with reserved clientSequenceNumber {}",
                        self.client_sequence_number
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    client_sequence_number: i64,
    reference_sequence_number: i64,
    #[serde(rename = "type")]
    kind: MessageType,
    contents: serde_json::Value,
    #[serde(default)]
    traces: Vec<Trace>,
}

impl TryFrom<WireOperation> for Operation {
    type Error = Error;

    fn try_from(wire: WireOperation) -> Result<Self> {
        let contents = match wire.kind {
            MessageType::Join => {
                let join: ClientJoin = serde_json::from_value(wire.contents)
                    .map_err(|e| Error::MalformedMessage(format!("join contents: {}", e)))?;
                Contents::Join(join)
            }
            MessageType::Leave => match wire.contents {
                serde_json::Value::String(client_id) => Contents::Leave(client_id),
                other => {
                    return Err(Error::MalformedMessage(format!(
                        "leave contents must be a clientId string, got {}",
                        other
                    )))
                }
            },
            MessageType::Op => Contents::Edit(wire.contents),
        };

        let operation = Operation {
            client_sequence_number: wire.client_sequence_number,
            reference_sequence_number: wire.reference_sequence_number,
            contents,
            traces: wire.traces,
        };
        operation.validate()?;
        Ok(operation)
    }
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        let kind = op.message_type();
        let contents = match op.contents {
            Contents::Join(join) => serde_json::json!({
                "clientId": join.client_id,
                "detail": join.detail,
            }),
            Contents::Leave(client_id) => serde_json::Value::String(client_id),
            Contents::Edit(payload) => payload,
        };

        WireOperation {
            client_sequence_number: op.client_sequence_number,
            reference_sequence_number: op.reference_sequence_number,
            kind,
            contents,
            traces: op.traces,
        }
    }
}

/// Message appended to the log, before ordering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperationMessage {
    /// `None` for system-originated (control) messages
    pub client_id: Option<String>,
    pub tenant_id: String,
    pub document_id: String,
    #[serde(rename = "type")]
    pub kind: RawKind,
    pub user: serde_json::Value,
    pub timestamp: u64,
    pub operation: Operation,
}

impl RawOperationMessage {
    pub fn new(
        key: &DocumentKey,
        client_id: Option<String>,
        user: serde_json::Value,
        operation: Operation,
    ) -> Self {
        Self {
            client_id,
            tenant_id: key.tenant_id().to_string(),
            document_id: key.document_id().to_string(),
            kind: RawKind::Raw,
            user,
            timestamp: clock::now_ms(),
            operation,
        }
    }

    /// Decode and validate a message read from the log
    pub fn decode(data: &[u8]) -> Result<Self> {
        let message: RawOperationMessage = serde_json::from_slice(data)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn key(&self) -> Result<DocumentKey> {
        DocumentKey::new(self.tenant_id.clone(), self.document_id.clone())
    }

    /// Control messages are system-originated; edits belong to a client
    pub fn validate(&self) -> Result<()> {
        self.operation.validate()?;
        match (self.operation.is_control(), &self.client_id) {
            (true, None) => Ok(()),
            (true, Some(_)) => Err(Error::MalformedMessage(format!(
                "{} must be system-originated",
                self.operation.message_type()
            ))),
            (false, Some(id)) if !id.is_empty() => Ok(()),
            (false, _) => Err(Error::MalformedMessage("op without a clientId".into())),
        }
    }

    /// The client this message belongs to, whether as sender or as the
    /// subject of a control message
    pub fn subject_client_id(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .or_else(|| self.operation.contents.control_client_id())
    }
}

/// Message after the sequencer assigned it a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOperationMessage {
    pub tenant_id: String,
    pub document_id: String,
    pub client_id: Option<String>,
    pub sequence_number: u64,
    pub timestamp: u64,
    pub operation: Operation,
}

impl SequencedOperationMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
