//! Response types

use bytes::{BufMut, BytesMut};
use ordo_core::{Error, SequencedOperationMessage};
use serde::Serialize;

/// A reply or push sent to the client
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// +OK [message]
    Ok(Option<String>),

    /// -ERR <code> <message>
    Error { code: String, message: String },

    /// $<length>\r\n<data>
    Bulk(Vec<u8>),

    /// *<count>\r\n<items>
    Array(Vec<Response>),

    /// #<sequenceNumber> <json>
    Sequenced { sequence_number: u64, data: Vec<u8> },

    /// :<integer>
    Integer(i64),

    /// Null response
    Null,

    /// PONG
    Pong,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(None)
    }

    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok(Some(msg.into()))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_command(msg: &str) -> Self {
        Response::Error {
            code: "INVALID_CMD".into(),
            message: msg.to_string(),
        }
    }

    /// Error reply for a core failure
    pub fn from_error(e: &Error) -> Self {
        Response::error(error_code(e), e.to_string())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Response::Bulk(data.into())
    }

    /// Bulk reply holding `value` as JSON
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Response::Bulk(data),
            Err(e) => Response::error("SERIALIZATION", e.to_string()),
        }
    }

    pub fn integer(n: i64) -> Self {
        Response::Integer(n)
    }

    /// Push frame for a sequenced message
    pub fn sequenced(message: &SequencedOperationMessage) -> Self {
        match message.encode() {
            Ok(data) => Response::Sequenced {
                sequence_number: message.sequence_number,
                data: data.to_vec(),
            },
            Err(e) => Response::from_error(&e),
        }
    }

    pub fn pong() -> Self {
        Response::Pong
    }

    pub fn null() -> Self {
        Response::Null
    }

    pub fn array(items: Vec<Response>) -> Self {
        Response::Array(items)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Encode the response to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the response into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Response::Ok(None) => {
                buf.put_slice(b"+OK\r\n");
            }
            Response::Ok(Some(msg)) => {
                buf.put_slice(b"+OK ");
                buf.put_slice(msg.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Error { code, message } => {
                buf.put_slice(b"-ERR ");
                buf.put_slice(code.as_bytes());
                buf.put_slice(b" ");
                // Keep the reply on one line
                buf.put_slice(message.replace(['\r', '\n'], " ").as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Bulk(data) => {
                buf.put_slice(b"$");
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Response::Array(items) => {
                buf.put_slice(b"*");
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode_into(buf);
                }
            }
            Response::Sequenced { sequence_number, data } => {
                buf.put_slice(b"#");
                buf.put_slice(sequence_number.to_string().as_bytes());
                buf.put_slice(b" ");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Response::Integer(n) => {
                buf.put_slice(b":");
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            Response::Pong => {
                buf.put_slice(b"+PONG\r\n");
            }
        }
    }
}

/// Reply code for a core error
pub fn error_code(e: &Error) -> &'static str {
    match e {
        Error::ReservationConflict { .. } => "CONFLICT",
        Error::NotLocal(_) => "NOT_LOCAL",
        Error::LeaseLost(_) => "LEASE_LOST",
        Error::LogAppend(_) => "LOG_APPEND",
        Error::Storage(_) => "STORAGE",
        Error::MalformedMessage(_) => "MALFORMED",
        Error::InvalidDocumentKey(_) => "INVALID_KEY",
        Error::Serialization(_) => "SERIALIZATION",
        Error::Configuration(_) => "CONFIG",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::{DocumentKey, Operation, RawOperationMessage, Sequencer, BroadcastHub, ClientJoin};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_encode_ok() {
        assert_eq!(Response::ok().encode().as_ref(), b"+OK\r\n");
        assert_eq!(Response::ok_with_message("hi").encode().as_ref(), b"+OK hi\r\n");
    }

    #[test]
    fn test_encode_error() {
        let resp = Response::from_error(&Error::LeaseLost("acme/notes".into()));
        let encoded = resp.encode();
        assert!(encoded.starts_with(b"-ERR LEASE_LOST "));
        assert!(encoded.ends_with(b"\r\n"));
    }

    #[test]
    fn test_error_message_stays_on_one_line() {
        let resp = Response::error("STORAGE", "disk\nfull");
        assert_eq!(resp.encode().as_ref(), b"-ERR STORAGE disk full\r\n");
    }

    #[test]
    fn test_encode_json_bulk() {
        let resp = Response::json(&json!({"a": 1}));
        assert_eq!(resp.encode().as_ref(), b"$7\r\n{\"a\":1}\r\n");
    }

    #[test]
    fn test_encode_array() {
        let resp = Response::array(vec![Response::ok(), Response::integer(1), Response::null()]);
        assert_eq!(resp.encode().as_ref(), b"*3\r\n+OK\r\n:1\r\n$-1\r\n");
    }

    #[test]
    fn test_encode_sequenced_push() {
        let key = DocumentKey::new("acme", "notes").unwrap();
        let sequencer = Sequencer::new(Arc::new(BroadcastHub::new()));
        let join = RawOperationMessage::new(
            &key,
            None,
            json!({}),
            Operation::join(ClientJoin { client_id: "c1".into(), detail: json!({}) }),
        );
        let sequenced = sequencer.process(&join.encode().unwrap()).unwrap();

        let encoded = Response::sequenced(&sequenced).encode();
        assert!(encoded.starts_with(b"#1 {"));

        let line = std::str::from_utf8(&encoded).unwrap().trim_end();
        let (_, body) = line.split_once(' ').unwrap();
        let decoded: SequencedOperationMessage = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.sequence_number, 1);
    }
}
