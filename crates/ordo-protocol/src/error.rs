//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Core error: {0}")]
    Core(#[from] ordo_core::Error),
}

impl ProtocolError {
    /// Short code sent in `-ERR` replies
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidCommand(_) => "INVALID_CMD",
            ProtocolError::MissingArgument(_) | ProtocolError::InvalidArgument(_) => "INVALID_ARG",
            ProtocolError::MessageTooLarge { .. } => "TOO_LARGE",
            ProtocolError::InvalidJson(_) => "INVALID_JSON",
            ProtocolError::Core(e) => crate::response::error_code(e),
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
