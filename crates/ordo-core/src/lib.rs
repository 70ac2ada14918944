//! Ordo Core - operation ordering for collaborative documents
//!
//! This crate assigns every client operation on a document a single,
//! agreed position:
//! - Connections mint Join, edit and Leave messages for one client
//! - Log-backed orderers append those messages to a shared partitioned log
//! - Local orderers sequence in memory while this node holds the document lease
//! - The orderer manager picks a path per document and sticks to it
//! - The sequencer turns raw messages into sequenced ones and broadcasts them

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod key;
pub mod local;
pub mod manager;
pub mod message;
pub mod node;
pub mod orderer;
pub mod producer;
pub mod reservation;
pub mod sequencer;
pub mod socket;
pub mod storage;

#[cfg(test)]
mod testing;

pub use broadcast::{BroadcastHub, Envelope, HubSocket};
pub use config::OrderingConfig;
pub use connection::{LogOrdererConnection, OrdererConnection};
pub use error::{Error, Result};
pub use factory::LogOrdererFactory;
pub use key::DocumentKey;
pub use local::{LocalOrderManager, LocalOrderer};
pub use manager::{OrdererManager, Route, RoutingStats};
pub use message::{
    ClientJoin, Contents, MessageType, Operation, RawOperationMessage, SequencedOperationMessage,
    Trace, CONTROL_CLIENT_SEQUENCE_NUMBER,
};
pub use node::{MemoryNodeStore, Node, NodeManager, NodeStore};
pub use orderer::{LogOrderer, Orderer};
pub use producer::{LogRecord, Producer};
pub use reservation::{Lease, LeaseStore, MemoryLeaseStore, ReservationManager};
pub use sequencer::{DocumentSequencer, Sequencer};
pub use socket::Socket;
pub use storage::{DocumentDetails, DocumentRecord, DocumentStorage};
