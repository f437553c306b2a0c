//! Connection pooling for the storage backend.
//!
//! Mirrors `TursoBackend`'s pool in the teacher: a semaphore-free, channel
//! based free-list so rapid command handling doesn't open a fresh
//! connection per call. `get_connection` hands out a [`PooledConnection`]
//! that returns itself to the pool on drop.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use turso_core::{Database, DatabaseOpts, MemoryIO, OpenFlags};
#[cfg(target_family = "unix")]
use turso_core::UnixIO;

use crate::errors::{EngineError, Result};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

struct ConnectionPool {
    available: Mutex<mpsc::UnboundedReceiver<turso::Connection>>,
    return_tx: mpsc::UnboundedSender<turso::Connection>,
    db: Arc<Database>,
}

impl ConnectionPool {
    fn new(db: Arc<Database>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            available: Mutex::new(rx),
            return_tx: tx,
            db,
        }
    }

    fn get_connection(&self) -> Result<PooledConnection> {
        let conn_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut available) = self.available.try_lock() {
            match available.try_recv() {
                Ok(conn) => {
                    tracing::debug!(conn_id, "reusing pooled connection");
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        return_tx: Some(self.return_tx.clone()),
                        conn_id,
                    });
                }
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => {}
            }
        }

        let conn_core = self
            .db
            .connect()
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let conn = turso::Connection::create(conn_core);
        tracing::debug!(conn_id, "opened new connection");

        Ok(PooledConnection {
            conn: Some(conn),
            return_tx: Some(self.return_tx.clone()),
            conn_id,
        })
    }
}

pub struct PooledConnection {
    conn: Option<turso::Connection>,
    return_tx: Option<mpsc::UnboundedSender<turso::Connection>>,
    conn_id: u64,
}

impl Deref for PooledConnection {
    type Target = turso::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(tx)) = (self.conn.take(), self.return_tx.take()) {
            if tx.send(conn).is_err() {
                tracing::debug!(conn_id = self.conn_id, "pool closed, dropping connection");
            }
        }
    }
}

/// Owns the database handle and its connection pool.
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        #[cfg(target_family = "unix")]
        {
            let io = Arc::new(UnixIO::new().map_err(|e| EngineError::storage(e.to_string()))?);
            let opts = DatabaseOpts::default();
            let path_str = path
                .as_ref()
                .to_str()
                .ok_or_else(|| EngineError::storage("invalid database path"))?;
            let db = Database::open_file_with_flags(io, path_str, OpenFlags::default(), opts, None)
                .map_err(|e| EngineError::storage(e.to_string()))?;
            Ok(Self {
                pool: ConnectionPool::new(Arc::new(db)),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            let _ = path;
            Self::open_in_memory().await
        }
    }

    pub async fn open_in_memory() -> Result<Self> {
        let io = Arc::new(MemoryIO::new());
        let opts = DatabaseOpts::default();
        let db = Database::open_file_with_flags(io, ":memory:", OpenFlags::default(), opts, None)
            .map_err(|e| EngineError::storage(e.to_string()))?;
        Ok(Self {
            pool: ConnectionPool::new(Arc::new(db)),
        })
    }

    pub fn connection(&self) -> Result<PooledConnection> {
        self.pool.get_connection()
    }
}
