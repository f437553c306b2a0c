//! Transaction Sequence (spec §4.2): a per-session nestable transaction
//! owning the relational transaction, the pending ExternalPartStorage
//! renames, and the Notification Collector buffer.
//!
//! There is no real nested-transaction support in the backend (turso
//! speaks the same flat `BEGIN`/`COMMIT`/`ROLLBACK` vocabulary as SQLite),
//! so nested `begin()` calls just bump a depth counter; only the outermost
//! `commit()` touches the database, matching "nested begins are accepted
//! and contribute to a single outermost commit".

use std::path::PathBuf;
use std::sync::Arc;

use pim_api::wire::ChangeEvent;

use crate::errors::{EngineError, Result};
use crate::notify::Collector;
use crate::storage::{PooledConnection, Store};

/// Batch size at which a streaming job forces an intermediate commit to
/// bound journal growth (spec §4.2, §4.7 step 4).
pub const BATCH_COMMIT_SIZE: u32 = 100;

struct PendingRename {
    staging: PathBuf,
    permanent: PathBuf,
}

pub struct Transaction {
    conn: PooledConnection,
    depth: u32,
    op_count: u32,
    collector: Collector,
    renames: Vec<PendingRename>,
    staged: Vec<PathBuf>,
    deletes: Vec<PathBuf>,
}

impl Transaction {
    async fn open(store: &Store) -> Result<Self> {
        let conn = store.connection()?;
        conn.execute("BEGIN", ()).await?;
        Ok(Self {
            conn,
            depth: 1,
            op_count: 0,
            collector: Collector::new(),
            renames: Vec::new(),
            staged: Vec::new(),
            deletes: Vec::new(),
        })
    }

    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }

    pub fn notify(&mut self, event: ChangeEvent) {
        self.collector.push(event);
    }

    /// Registers a staging file written by the Part Streamer (spec §4.5);
    /// it is renamed into place on commit, deleted on rollback.
    pub fn stage_part_write(&mut self, staging: PathBuf, permanent: PathBuf) {
        self.staged.push(staging.clone());
        self.renames.push(PendingRename { staging, permanent });
    }

    /// Queues an External part's on-disk file for removal, finalized only
    /// on commit (spec §4.5's two-phase protocol applies to deletes too:
    /// the row is gone the instant the DB transaction commits, but the
    /// file it backed is only unlinked once that's certain, never on a
    /// rollback that restored the row).
    pub fn stage_part_delete(&mut self, permanent: PathBuf) {
        self.deletes.push(permanent);
    }

    /// Call once per child sub-operation in a streaming job; returns
    /// `true` if this call forced an intermediate commit (spec §4.2, the
    /// caller must have disabled automatic-commit and must re-begin after
    /// a `true` result if it wants to keep batching).
    pub async fn note_child_operation(&mut self) -> Result<bool> {
        self.op_count += 1;
        if self.op_count >= BATCH_COMMIT_SIZE {
            self.commit_relational().await?;
            self.conn.execute("BEGIN", ()).await?;
            self.op_count = 0;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn commit_relational(&mut self) -> Result<()> {
        self.conn.execute("COMMIT", ()).await?;
        for rename in self.renames.drain(..) {
            if let Some(parent) = rename.permanent.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::rename(&rename.staging, &rename.permanent).await?;
        }
        self.staged.clear();
        for path in self.deletes.drain(..) {
            tokio::fs::remove_file(&path).await.ok();
        }
        Ok(())
    }

    async fn rollback_relational(&mut self) -> Result<()> {
        self.conn.execute("ROLLBACK", ()).await?;
        for path in self.staged.drain(..) {
            tokio::fs::remove_file(&path).await.ok();
        }
        self.renames.clear();
        // The DB row these files backed is restored by the rollback, so
        // the files themselves must survive too.
        self.deletes.clear();
        Ok(())
    }
}

/// Owns the at-most-one active transaction chain for a session.
pub struct Session {
    id: String,
    store: Arc<Store>,
    current: Option<Transaction>,
}

impl Session {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            current: None,
        }
    }

    /// Stable identity for this session, keying its subscription rows
    /// (spec §4.3's Subscription state supplement) and nothing else.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_open_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Raw store access for read-only pre-checks that must not themselves
    /// open a transaction (e.g. Collection Sync's no-op short-circuit,
    /// spec §4.7 step 2).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Pushes a frame. Opens the relational transaction on the first call;
    /// merely deepens the chain on subsequent nested calls.
    pub async fn begin(&mut self) -> Result<()> {
        match &mut self.current {
            Some(tx) => {
                tx.depth += 1;
                Ok(())
            }
            None => {
                self.current = Some(Transaction::open(&self.store).await?);
                Ok(())
            }
        }
    }

    pub fn transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut()
    }

    /// Connection of the currently open transaction, opening an implicit
    /// one first if none is active.
    pub async fn ensure_open(&mut self) -> Result<bool> {
        let implicit = self.current.is_none();
        if implicit {
            self.begin().await?;
        }
        Ok(implicit)
    }

    pub fn conn(&self) -> Result<&PooledConnection> {
        self.current
            .as_ref()
            .map(Transaction::connection)
            .ok_or(EngineError::NoTransaction)
    }

    pub fn push_event(&mut self, event: ChangeEvent) -> Result<()> {
        self.current
            .as_mut()
            .ok_or(EngineError::NoTransaction)?
            .notify(event);
        Ok(())
    }

    /// Ends an implicit transaction opened by `ensure_open`, committing on
    /// success and rolling back on failure. Returns the drained events.
    pub async fn finish_implicit<T>(
        &mut self,
        implicit: bool,
        result: Result<T>,
    ) -> Result<(T, Vec<ChangeEvent>)> {
        if !implicit {
            return result.map(|v| (v, Vec::new()));
        }
        match result {
            Ok(v) => {
                let events = self.commit().await?;
                Ok((v, events))
            }
            Err(e) => {
                let _ = self.rollback().await;
                Err(e)
            }
        }
    }

    /// Pops a frame. Only the outermost pop commits the relational
    /// transaction and dispatches the drained notifications.
    pub async fn commit(&mut self) -> Result<Vec<ChangeEvent>> {
        let tx = self.current.as_mut().ok_or(EngineError::NoTransaction)?;
        if tx.depth > 1 {
            tx.depth -= 1;
            return Ok(Vec::new());
        }
        let mut tx = self.current.take().expect("checked above");
        tx.commit_relational().await?;
        Ok(tx.collector.drain())
    }

    /// Aborts the whole chain regardless of nesting depth (spec §4.2:
    /// "`rollback` aborts the whole chain").
    pub async fn rollback(&mut self) -> Result<()> {
        let mut tx = self.current.take().ok_or(EngineError::NoTransaction)?;
        tx.rollback_relational().await
    }

    pub async fn note_child_operation(&mut self) -> Result<bool> {
        let tx = self.current.as_mut().ok_or(EngineError::NoTransaction)?;
        tx.note_child_operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_without_transaction_is_no_transaction() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut session = Session::new(store);
        let err = session.commit().await.unwrap_err();
        assert!(matches!(err, EngineError::NoTransaction));
    }

    #[tokio::test]
    async fn nested_begin_requires_outermost_commit() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut session = Session::new(store);
        session.begin().await.unwrap();
        session.begin().await.unwrap();
        let events = session.commit().await.unwrap();
        assert!(events.is_empty());
        assert!(session.has_open_transaction());
        let events = session.commit().await.unwrap();
        assert!(events.is_empty());
        assert!(!session.has_open_transaction());
    }

    #[tokio::test]
    async fn rollback_closes_chain_regardless_of_depth() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut session = Session::new(store);
        session.begin().await.unwrap();
        session.begin().await.unwrap();
        session.rollback().await.unwrap();
        assert!(!session.has_open_transaction());
        assert!(matches!(
            session.rollback().await.unwrap_err(),
            EngineError::NoTransaction
        ));
    }
}
