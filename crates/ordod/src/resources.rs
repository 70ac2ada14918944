//! Wiring of stores, orderers and the sequencer for one daemon process

use std::sync::Arc;

use anyhow::Result;
use ordo_core::{
    BroadcastHub, DocumentStorage, LeaseStore, LocalOrderManager, LogOrdererFactory, LogRecord,
    MemoryLeaseStore, MemoryNodeStore, NodeManager, NodeStore, OrdererManager, Producer,
    ReservationManager, Sequencer,
};
use ordo_storage::{MemoryDocumentStorage, MemoryLog};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Backend, Config};

/// Everything the servers share
pub struct Resources {
    pub config: Config,
    pub hub: Arc<BroadcastHub>,
    pub sequencer: Arc<Sequencer>,
    pub producer: Arc<dyn Producer>,
    pub nodes: Arc<NodeManager>,
    pub local: Option<Arc<LocalOrderManager>>,
    pub manager: Arc<OrdererManager>,
    tail: Option<mpsc::UnboundedReceiver<LogRecord>>,
}

/// Collaborators picked by the backend
struct Stores {
    producer: Arc<dyn Producer>,
    documents: Arc<dyn DocumentStorage>,
    leases: Arc<dyn LeaseStore>,
    nodes: Arc<dyn NodeStore>,
    tail: mpsc::UnboundedReceiver<LogRecord>,
    backlog: Vec<LogRecord>,
}

impl Resources {
    /// Open the configured stores and wire the orderers. The SQLite backend
    /// starts following its log, so this must run within a Tokio runtime.
    pub fn build(config: Config) -> Result<Self> {
        let stores = open_stores(&config)?;
        let ordering = &config.ordering;

        let hub = Arc::new(BroadcastHub::new());
        let sequencer = Arc::new(Sequencer::new(hub.clone()));

        // Rebuild sequencing state before the live tail takes over
        for record in &stores.backlog {
            sequencer.process_record(record);
        }
        if !stores.backlog.is_empty() {
            info!(records = stores.backlog.len(), "Replayed stored log");
        }

        let nodes = Arc::new(NodeManager::new(
            config.node_id.clone(),
            config.advertised_address(),
            stores.nodes,
            ordering.node_grace,
        ));

        let local = config.local_ordering.then(|| {
            let reservations = Arc::new(ReservationManager::new(stores.leases.clone(), ordering.lease_ttl));
            Arc::new(LocalOrderManager::new(
                nodes.clone(),
                reservations,
                stores.documents.clone(),
                hub.clone(),
                &ordering.ingress_name,
            ))
        });

        let factory = Arc::new(LogOrdererFactory::new(
            stores.producer.clone(),
            stores.documents.clone(),
            &ordering.ingress_name,
        ));
        let manager = Arc::new(OrdererManager::new(local.clone(), factory));

        Ok(Self {
            config,
            hub,
            sequencer,
            producer: stores.producer,
            nodes,
            local,
            manager,
            tail: Some(stores.tail),
        })
    }

    /// Live log tail for the sequencer; available once
    pub fn take_tail(&mut self) -> Option<mpsc::UnboundedReceiver<LogRecord>> {
        self.tail.take()
    }

    /// Release held leases and close the producer
    pub async fn dispose(&self) {
        if let Some(local) = &self.local {
            match local.release_all().await {
                Ok(released) => info!(released, "Released document leases"),
                Err(e) => warn!(error = %e, "Failed to release leases"),
            }
        }

        if let Err(e) = self.producer.close().await {
            warn!(error = %e, "Failed to close log producer");
        }
    }
}

fn open_stores(config: &Config) -> Result<Stores> {
    match config.backend {
        Backend::Memory => {
            info!("Using in-memory backend (state is lost on exit)");
            let log = Arc::new(MemoryLog::new());
            let tail = log.subscribe();
            Ok(Stores {
                producer: log,
                documents: Arc::new(MemoryDocumentStorage::new()),
                leases: Arc::new(MemoryLeaseStore::new()),
                nodes: Arc::new(MemoryNodeStore::new()),
                tail,
                backlog: Vec::new(),
            })
        }
        Backend::Sqlite => open_sqlite(config),
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &Config) -> Result<Stores> {
    use anyhow::Context;
    use ordo_storage::SqliteStore;

    let path = config
        .db
        .as_ref()
        .context("the sqlite backend requires db")?;
    info!(path = %path.display(), "Using SQLite backend");

    let store = Arc::new(SqliteStore::new(path)?);
    // Other processes may append to the same log: follow the table, not
    // this process's own appends
    let backlog = store.read_after(0, None)?;
    let cursor = backlog.last().map(|(id, _)| *id).unwrap_or(0);
    let tail = store.tail(cursor, config.log_poll);
    let backlog = backlog.into_iter().map(|(_, record)| record).collect();

    Ok(Stores {
        producer: store.clone(),
        documents: store.clone(),
        leases: store.clone(),
        nodes: store,
        tail,
        backlog,
    })
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &Config) -> Result<Stores> {
    anyhow::bail!("ordod was built without the sqlite feature")
}
