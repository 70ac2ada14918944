//! SQLite storage backend
//!
//! A single database file holds the partitioned log, document records,
//! leases and the node table, so several `ordod` processes on one host can
//! share it as their fleet state. Every process follows the log table
//! itself, so all of them sequence the same records in the same order.

use crate::{StorageError, StorageStats};
use async_trait::async_trait;
use bytes::Bytes;
use ordo_core::clock;
use ordo_core::{
    DocumentDetails, DocumentKey, DocumentRecord, DocumentStorage, Error, Lease, LeaseStore,
    LogRecord, Node, NodeStore, Producer, Result,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Records fetched per poll of the log table
const TAIL_BATCH: usize = 512;

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// SQLite-backed log, document, lease and node store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn new(path: impl AsRef<Path>) -> std::result::Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        // Readers tailing the log do not block appends from other processes
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        info!(path = %path.as_ref().display(), "Opened SQLite store");
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> std::result::Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> std::result::Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> std::result::Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                partition_key TEXT NOT NULL,
                position INTEGER NOT NULL,
                payload BLOB NOT NULL,
                appended_at INTEGER NOT NULL,
                UNIQUE (partition_key, position)
            );

            CREATE TABLE IF NOT EXISTS documents (
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                parent_branch TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, document_id)
            );

            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                last_heartbeat_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    /// Records with a log id above `after`, in append order across all
    /// processes sharing the database. `limit` of `None` reads to the end.
    pub fn read_after(
        &self,
        after: i64,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<(i64, LogRecord)>, StorageError> {
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, partition_key, position, payload FROM log WHERE id > ?1 ORDER BY id LIMIT ?2",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![after, limit], |row| {
                let id: i64 = row.get(0)?;
                let payload: Vec<u8> = row.get(3)?;
                Ok((
                    id,
                    LogRecord {
                        partition_key: row.get(1)?,
                        offset: row.get::<_, i64>(2)? as u64,
                        payload: Bytes::from(payload),
                    },
                ))
            })
            .map_err(db_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    /// Every stored record in append order
    pub fn read_all(&self) -> std::result::Result<Vec<LogRecord>, StorageError> {
        Ok(self
            .read_after(0, None)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Follow the log table from just after id `after`.
    ///
    /// Sees appends made by any process on the same database, polling every
    /// `poll_interval` when caught up. Stops when the store is closed or the
    /// receiver is dropped. Must be called within a Tokio runtime.
    pub fn tail(self: &Arc<Self>, after: i64, poll_interval: Duration) -> mpsc::UnboundedReceiver<LogRecord> {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().follow(after, poll_interval, sender));
        receiver
    }

    async fn follow(self: Arc<Self>, mut cursor: i64, poll_interval: Duration, sender: mpsc::UnboundedSender<LogRecord>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(after = cursor, "Following SQLite log");

        loop {
            if self.closed.load(Ordering::SeqCst) || sender.is_closed() {
                break;
            }

            match self.read_after(cursor, Some(TAIL_BATCH)) {
                Ok(batch) => {
                    let full = batch.len() == TAIL_BATCH;
                    for (id, record) in batch {
                        cursor = id;
                        if sender.send(record).is_err() {
                            return;
                        }
                    }
                    if full {
                        continue;
                    }
                }
                Err(e) => warn!(error = %e, after = cursor, "Failed to poll SQLite log"),
            }

            ticker.tick().await;
        }
        debug!(after = cursor, "Stopped following SQLite log");
    }

    /// Create a branch record pointing at `parent`
    pub fn create_branch(
        &self,
        key: &DocumentKey,
        parent: &DocumentKey,
    ) -> std::result::Result<DocumentRecord, StorageError> {
        let record = DocumentRecord {
            tenant_id: key.tenant_id().to_string(),
            document_id: key.document_id().to_string(),
            parent_branch: Some(parent.document_id().to_string()),
            created_at: clock::now_ms(),
        };

        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO documents (tenant_id, document_id, parent_branch, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.tenant_id,
                    record.document_id,
                    record.parent_branch,
                    record.created_at as i64
                ],
            )
            .map_err(db_err)?;

        if inserted == 0 {
            return Err(StorageError::Database(format!("document {} already exists", key)));
        }
        Ok(record)
    }

    pub fn stats(&self) -> std::result::Result<StorageStats, StorageError> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> std::result::Result<usize, StorageError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(db_err)
        };

        Ok(StorageStats {
            document_count: count("SELECT COUNT(*) FROM documents")?,
            partition_count: count("SELECT COUNT(DISTINCT partition_key) FROM log")?,
            record_count: count("SELECT COUNT(*) FROM log")?,
        })
    }

    fn append(&self, message: Bytes, partition_key: &str) -> std::result::Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM log WHERE partition_key = ?1",
                params![partition_key],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        tx.execute(
            "INSERT INTO log (partition_key, position, payload, appended_at) VALUES (?1, ?2, ?3, ?4)",
            params![partition_key, position, message.as_ref(), clock::now_ms() as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_document(
        conn: &Connection,
        key: &DocumentKey,
    ) -> std::result::Result<Option<DocumentRecord>, StorageError> {
        conn.query_row(
            "SELECT tenant_id, document_id, parent_branch, created_at FROM documents WHERE tenant_id = ?1 AND document_id = ?2",
            params![key.tenant_id(), key.document_id()],
            |row| {
                Ok(DocumentRecord {
                    tenant_id: row.get(0)?,
                    document_id: row.get(1)?,
                    parent_branch: row.get(2)?,
                    created_at: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn load_lease(conn: &Connection, key: &str) -> std::result::Result<Option<Lease>, StorageError> {
        conn.query_row(
            "SELECT key, owner, expires_at FROM leases WHERE key = ?1",
            params![key],
            |row| {
                Ok(Lease {
                    key: row.get(0)?,
                    owner: row.get(1)?,
                    expires_at: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

#[async_trait]
impl Producer for SqliteStore {
    async fn send(&self, message: Bytes, partition_key: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::LogAppend("log is closed".into()));
        }
        self.append(message, partition_key)
            .map_err(|e| Error::LogAppend(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("SQLite log closed");
        Ok(())
    }
}

#[async_trait]
impl DocumentStorage for SqliteStore {
    async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO documents (tenant_id, document_id, parent_branch, created_at) VALUES (?1, ?2, NULL, ?3)",
                params![key.tenant_id(), key.document_id(), clock::now_ms() as i64],
            )
            .map_err(db_err)?;

        let value = Self::load_document(&tx, key)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        tx.commit().map_err(db_err)?;

        Ok(DocumentDetails {
            existing: inserted == 0,
            value,
        })
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn reserve(&self, node_id: &str, key: &str, ttl: Duration) -> Result<Lease> {
        let now = clock::now_ms();
        let expires_at = now + ttl.as_millis() as u64;
        let conn = self.conn.lock();

        // One statement: insert, renew our own lease, or take over an expired one
        let changed = conn
            .execute(
                r#"
                INSERT INTO leases (key, owner, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
                WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4
                "#,
                params![key, node_id, expires_at as i64, now as i64],
            )
            .map_err(db_err)?;

        if changed == 0 {
            let owner = Self::load_lease(&conn, key)?
                .map(|lease| lease.owner)
                .unwrap_or_default();
            return Err(Error::ReservationConflict {
                key: key.to_string(),
                owner,
            });
        }

        Ok(Lease {
            key: key.to_string(),
            owner: node_id.to_string(),
            expires_at,
        })
    }

    async fn release(&self, node_id: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM leases WHERE key = ?1 AND owner = ?2",
                params![key, node_id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>> {
        let conn = self.conn.lock();
        Ok(Self::load_lease(&conn, key)?)
    }
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn upsert(&self, node: Node) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO nodes (node_id, address, last_heartbeat_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(node_id) DO UPDATE SET address = excluded.address, last_heartbeat_at = excluded.last_heartbeat_at
            "#,
            params![node.node_id, node.address, node.last_heartbeat_at as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                "SELECT node_id, address, last_heartbeat_at FROM nodes WHERE node_id = ?1",
                params![node_id],
                |row| {
                    Ok(Node {
                        node_id: row.get(0)?,
                        address: row.get(1)?,
                        last_heartbeat_at: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        Ok(node)
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT node_id, address, last_heartbeat_at FROM nodes ORDER BY node_id")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Node {
                    node_id: row.get(0)?,
                    address: row.get(1)?,
                    last_heartbeat_at: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(db_err)?;

        let nodes = rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?;
        Ok(nodes)
    }
}
