//! Ordo wire protocol
//!
//! A line-oriented text protocol in the style of Redis RESP.
//!
//! ## Command Format
//! ```text
//! CONNECT <tenant> <document> [USER <json>] [CLIENT <json>]
//! SUBMIT <clientSeq> <refSeq> <json>
//! DISCONNECT | PING | INFO | NODES | QUIT
//! ```
//!
//! ## Response Format
//! ```text
//! +OK [message]               # Success
//! -ERR <code> <message>       # Error
//! $<length>\r\n<data>         # Bulk data (JSON)
//! *<count>\r\n<items>         # Array
//! :<integer>                  # Integer
//! #<sequenceNumber> <json>    # Pushed sequenced message
//! ```

pub mod command;
pub mod error;
pub mod parser;
pub mod response;

pub use command::{Command, CommandKind};
pub use error::{ProtocolError, ProtocolResult};
pub use parser::Parser;
pub use response::{error_code, Response};
