//! Command parser

use crate::command::{Command, CommandKind};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::BytesMut;
use serde_json::Value;
use tracing::trace;

/// Maximum message size (1MB)
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Incremental line parser for client commands
pub struct Parser {
    buffer: BytesMut,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if self.buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: self.buffer.len() + data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Try to parse a complete command from the buffer
    pub fn parse(&mut self) -> ProtocolResult<Option<Command>> {
        let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };

        // Accept both \r\n and \n
        let line_len = if line_end > 0 && self.buffer[line_end - 1] == b'\r' {
            line_end - 1
        } else {
            line_end
        };

        let line = String::from_utf8_lossy(&self.buffer[..line_len]).to_string();
        let _ = self.buffer.split_to(line_end + 1);

        let command = Self::parse_line(&line)?;
        trace!(command = command.name(), "Parsed command");
        Ok(Some(command))
    }

    /// Parse a single command line
    pub fn parse_line(line: &str) -> ProtocolResult<Command> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::InvalidCommand("Empty command".into()));
        }

        let mut tokens = Tokenizer::new(line);
        let cmd = tokens
            .next()
            .ok_or_else(|| ProtocolError::InvalidCommand("Empty command".into()))?
            .to_uppercase();

        let command = match cmd.as_str() {
            "CONNECT" => Self::parse_connect(&mut tokens)?,
            "SUBMIT" => Self::parse_submit(&mut tokens)?,
            "DISCONNECT" => Command::disconnect(),
            "PING" => Command::ping(),
            "QUIT" => Command::quit(),
            "INFO" => Command::info(),
            "NODES" => Command::nodes(),
            _ => return Err(ProtocolError::InvalidCommand(format!("Unknown command: {}", cmd))),
        };

        if let Some(extra) = tokens.rest() {
            return Err(ProtocolError::InvalidArgument(format!("Unexpected input: {}", extra)));
        }
        Ok(command)
    }

    fn parse_connect(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let tenant = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("tenant".into()))?;
        let document = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("document".into()))?;

        let mut user = Value::Object(Default::default());
        let mut client = Value::Object(Default::default());

        while let Some(opt) = tokens.next() {
            match opt.to_uppercase().as_str() {
                "USER" => {
                    user = tokens
                        .json()
                        .ok_or_else(|| ProtocolError::MissingArgument("user value".into()))??;
                }
                "CLIENT" => {
                    client = tokens
                        .json()
                        .ok_or_else(|| ProtocolError::MissingArgument("client value".into()))??;
                }
                _ => return Err(ProtocolError::InvalidArgument(format!("Unknown option: {}", opt))),
            }
        }

        Ok(Command::connect(tenant.to_string(), document.to_string(), user, client))
    }

    fn parse_submit(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let csn = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("clientSequenceNumber".into()))?;
        let csn: i64 = csn
            .parse()
            .map_err(|_| ProtocolError::InvalidArgument(format!("Invalid clientSequenceNumber: {}", csn)))?;

        let rsn = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("referenceSequenceNumber".into()))?;
        let rsn: i64 = rsn
            .parse()
            .map_err(|_| ProtocolError::InvalidArgument(format!("Invalid referenceSequenceNumber: {}", rsn)))?;

        let contents = tokens
            .json()
            .ok_or_else(|| ProtocolError::MissingArgument("contents".into()))??;

        Ok(Command::submit(csn, rsn, contents))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Whitespace tokenizer that also reads embedded JSON values
struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn skip_spaces(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        if self.pos >= self.input.len() {
            return None;
        }

        let remaining = &self.input[self.pos..];

        if let Some(quoted) = remaining.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                self.pos += end + 2;
                return Some(&quoted[..end]);
            }
        }

        let end = remaining.find(' ').unwrap_or(remaining.len());
        self.pos += end;
        Some(&remaining[..end])
    }

    /// Read one JSON value, which may contain spaces
    fn json(&mut self) -> Option<ProtocolResult<Value>> {
        self.skip_spaces();
        if self.pos >= self.input.len() {
            return None;
        }

        let remaining = &self.input[self.pos..];
        let mut stream = serde_json::Deserializer::from_str(remaining).into_iter::<Value>();
        match stream.next()? {
            Ok(value) => {
                self.pos += stream.byte_offset();
                Some(Ok(value))
            }
            Err(e) => Some(Err(ProtocolError::InvalidJson(e.to_string()))),
        }
    }

    fn rest(&mut self) -> Option<String> {
        self.skip_spaces();
        if self.pos >= self.input.len() {
            return None;
        }

        let remaining = self.input[self.pos..].to_string();
        self.pos = self.input.len();
        Some(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &[u8]) -> ProtocolResult<Command> {
        let mut parser = Parser::new();
        parser.feed(line).unwrap();
        parser.parse().map(|c| c.unwrap())
    }

    #[test]
    fn test_parse_connect() {
        let cmd = parse(b"CONNECT acme notes\r\n").unwrap();
        assert_eq!(cmd.document_id.as_deref(), Some("notes"));
        assert!(matches!(cmd.kind, CommandKind::Connect { ref tenant_id, .. } if tenant_id == "acme"));
    }

    #[test]
    fn test_parse_connect_with_json_options() {
        let cmd = parse(b"CONNECT acme notes USER {\"name\": \"Ada Lovelace\"} CLIENT {\"mode\": \"write\"}\n").unwrap();
        match cmd.kind {
            CommandKind::Connect { user, client, .. } => {
                assert_eq!(user, json!({"name": "Ada Lovelace"}));
                assert_eq!(client, json!({"mode": "write"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_submit() {
        let cmd = parse(b"SUBMIT 3 7 {\"insert\": \"hello world\"}\r\n").unwrap();
        assert_eq!(
            cmd.kind,
            CommandKind::Submit {
                client_sequence_number: 3,
                reference_sequence_number: 7,
                contents: json!({"insert": "hello world"}),
            }
        );
    }

    #[test]
    fn test_submit_requires_valid_json() {
        assert!(matches!(parse(b"SUBMIT 1 0 {oops\n"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(parse(b"SUBMIT 1 0\n"), Err(ProtocolError::MissingArgument(_))));
        assert!(matches!(parse(b"SUBMIT x 0 {}\n"), Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn test_trailing_input_is_rejected() {
        assert!(matches!(parse(b"SUBMIT 1 0 {} {}\n"), Err(ProtocolError::InvalidArgument(_))));
        assert!(matches!(parse(b"PING now\n"), Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse(b"ping\r\n").unwrap().kind, CommandKind::Ping);
        assert_eq!(parse(b"DISCONNECT\n").unwrap().kind, CommandKind::Disconnect);
        assert_eq!(parse(b"NODES\n").unwrap().kind, CommandKind::Nodes);
        assert!(matches!(parse(b"FLY\n"), Err(ProtocolError::InvalidCommand(_))));
    }

    #[test]
    fn test_incomplete_command() {
        let mut parser = Parser::new();
        parser.feed(b"CONNECT acme").unwrap();
        assert!(parser.parse().unwrap().is_none());

        parser.feed(b" notes\r\nPING\r\n").unwrap();
        assert!(parser.parse().unwrap().is_some());
        assert_eq!(parser.parse().unwrap().unwrap().kind, CommandKind::Ping);
        assert!(parser.parse().unwrap().is_none());
    }

    #[test]
    fn test_oversized_input_is_refused() {
        let mut parser = Parser::new();
        let big = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(parser.feed(&big), Err(ProtocolError::MessageTooLarge { .. })));
    }
}
