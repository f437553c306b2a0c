//! Relational storage backend: connection pooling, schema, filter
//! compilation, column codecs and the per-entity repository operations the
//! command handlers and sync engines are built on.

pub mod codec;
pub mod pool;
pub mod query;
pub mod repo;
pub mod schema;

pub use pool::{PooledConnection, Store};

use crate::errors::Result;

/// Opens `store` and runs the DDL. Idempotent: every statement is
/// `CREATE ... IF NOT EXISTS`.
pub async fn init(store: &Store) -> Result<()> {
    let conn = store.connection()?;
    schema::init_schema(&conn).await
}
