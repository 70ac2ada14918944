//! Command types

use serde_json::Value;

/// A parsed command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    /// Document named by the command, if any
    pub document_id: Option<String>,
}

/// All supported commands
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// CONNECT <tenant> <document> [USER <json>] [CLIENT <json>]
    Connect {
        tenant_id: String,
        user: Value,
        client: Value,
    },

    /// SUBMIT <clientSeq> <refSeq> <json>
    Submit {
        client_sequence_number: i64,
        reference_sequence_number: i64,
        contents: Value,
    },

    /// DISCONNECT
    Disconnect,

    /// PING
    Ping,

    /// QUIT
    Quit,

    /// INFO
    Info,

    /// NODES
    Nodes,
}

impl Command {
    pub fn connect(tenant_id: String, document_id: String, user: Value, client: Value) -> Self {
        Command {
            kind: CommandKind::Connect {
                tenant_id,
                user,
                client,
            },
            document_id: Some(document_id),
        }
    }

    pub fn submit(client_sequence_number: i64, reference_sequence_number: i64, contents: Value) -> Self {
        Command {
            kind: CommandKind::Submit {
                client_sequence_number,
                reference_sequence_number,
                contents,
            },
            document_id: None,
        }
    }

    pub fn disconnect() -> Self {
        Command {
            kind: CommandKind::Disconnect,
            document_id: None,
        }
    }

    pub fn ping() -> Self {
        Command {
            kind: CommandKind::Ping,
            document_id: None,
        }
    }

    pub fn quit() -> Self {
        Command {
            kind: CommandKind::Quit,
            document_id: None,
        }
    }

    pub fn info() -> Self {
        Command {
            kind: CommandKind::Info,
            document_id: None,
        }
    }

    pub fn nodes() -> Self {
        Command {
            kind: CommandKind::Nodes,
            document_id: None,
        }
    }

    /// Command name, used as a metrics label
    pub fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::Connect { .. } => "connect",
            CommandKind::Submit { .. } => "submit",
            CommandKind::Disconnect => "disconnect",
            CommandKind::Ping => "ping",
            CommandKind::Quit => "quit",
            CommandKind::Info => "info",
            CommandKind::Nodes => "nodes",
        }
    }
}
