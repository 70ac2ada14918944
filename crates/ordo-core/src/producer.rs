//! Log collaborator interface

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A record as stored in one partition of the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub partition_key: String,
    /// Position within the partition, starting at 0
    pub offset: u64,
    pub payload: Bytes,
}

/// Append side of the durable, partitioned log.
///
/// Records sharing a partition key are delivered in append order.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Append a serialized message. Resolves once the log accepted it;
    /// an error means the message was not appended.
    async fn send(&self, message: Bytes, partition_key: &str) -> Result<()>;

    /// Flush and release the producer
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
