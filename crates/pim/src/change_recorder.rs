//! Change Recorder (spec §4.3, §9): a durable, replayable log of
//! [`ChangeEvent`]s so a client that was offline can resume exactly where
//! it left off instead of replaying the whole notification stream.
//!
//! Backed by `change_recorder_log` (an append-only, auto-incrementing
//! offset table) and `change_recorder_cursor` (one row per consumer,
//! tracking how far it has read). Each row holds one JSON-encoded event;
//! turso's `BLOB` column does the length-prefixing for us.

use pim_api::wire::ChangeEvent;
use turso::{params, Value};

use crate::errors::{EngineError, Result};
use crate::storage::pool::PooledConnection;

/// Appends every event from one transaction's drained [`notify::Collector`]
/// to the log. Called at commit time, inside the same transaction as the
/// relational changes it describes, so a crash between the two can never
/// happen.
pub async fn record(conn: &PooledConnection, events: &[ChangeEvent]) -> Result<()> {
    for event in events {
        let payload = serde_json::to_vec(event).map_err(|e| EngineError::storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO change_recorder_log (payload) VALUES (?)",
            params![Value::Blob(payload)],
        )
        .await?;
    }
    Ok(())
}

/// One logged event plus the offset it was stored at, so callers can
/// advance their cursor past exactly the events they've consumed.
pub struct Entry {
    pub offset: i64,
    pub event: ChangeEvent,
}

/// Events after `consumer`'s last acknowledged offset, oldest first.
/// A consumer seen for the first time starts from the beginning of the log.
pub async fn replay(conn: &PooledConnection, consumer: &str, limit: i64) -> Result<Vec<Entry>> {
    let since = cursor(conn, consumer).await?.unwrap_or(0);
    let mut stmt = conn
        .prepare("SELECT offset, payload FROM change_recorder_log WHERE offset > ? ORDER BY offset LIMIT ?")
        .await?;
    let mut rows = stmt.query(params![since, limit]).await?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        let offset = row.get::<i64>(0)?;
        let payload = row.get::<Vec<u8>>(1)?;
        let event: ChangeEvent = serde_json::from_slice(&payload).map_err(|e| EngineError::storage(e.to_string()))?;
        entries.push(Entry { offset, event });
    }
    Ok(entries)
}

/// Records that `consumer` has successfully processed everything up to and
/// including `offset`. Idempotent: replaying the same ack twice is a no-op.
pub async fn acknowledge(conn: &PooledConnection, consumer: &str, offset: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO change_recorder_cursor (consumer, last_offset) VALUES (?, ?)
         ON CONFLICT(consumer) DO UPDATE SET last_offset = excluded.last_offset
         WHERE excluded.last_offset > change_recorder_cursor.last_offset",
        params![consumer.to_string(), offset],
    )
    .await?;
    Ok(())
}

async fn cursor(conn: &PooledConnection, consumer: &str) -> Result<Option<i64>> {
    let mut stmt = conn
        .prepare("SELECT last_offset FROM change_recorder_cursor WHERE consumer = ?")
        .await?;
    let mut rows = stmt.query(params![consumer.to_string()]).await?;
    if let Some(row) = rows.next().await? {
        Ok(Some(row.get::<i64>(0)?))
    } else {
        Ok(None)
    }
}

/// Drops log entries every registered consumer has already acknowledged.
/// Called periodically by the cache cleaner's interval task (spec §9), not
/// after every commit, so a slow consumer doesn't stall the writer.
pub async fn compact(conn: &PooledConnection) -> Result<u64> {
    let mut stmt = conn.prepare("SELECT MIN(last_offset) FROM change_recorder_cursor").await?;
    let mut rows = stmt.query(()).await?;
    let Some(row) = rows.next().await? else {
        return Ok(0);
    };
    let min_offset = row.get::<Option<i64>>(0)?;
    let Some(min_offset) = min_offset else {
        return Ok(0);
    };

    let mut count_stmt = conn
        .prepare("SELECT COUNT(*) FROM change_recorder_log WHERE offset <= ?")
        .await?;
    let mut count_rows = count_stmt.query(params![min_offset]).await?;
    let dropped = match count_rows.next().await? {
        Some(row) => row.get::<i64>(0)? as u64,
        None => 0,
    };

    conn.execute(
        "DELETE FROM change_recorder_log WHERE offset <= ?",
        params![min_offset],
    )
    .await?;
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use pim_api::CollectionId;

    #[tokio::test]
    async fn replay_resumes_from_cursor() {
        let store = Store::open_in_memory().await.unwrap();
        crate::storage::init(&store).await.unwrap();
        let conn = store.connection().unwrap();

        let events = vec![
            ChangeEvent::CollectionAdded { collection_id: CollectionId(1) },
            ChangeEvent::CollectionAdded { collection_id: CollectionId(2) },
        ];
        record(&conn, &events).await.unwrap();

        let all = replay(&conn, "client-a", 100).await.unwrap();
        assert_eq!(all.len(), 2);

        acknowledge(&conn, "client-a", all[0].offset).await.unwrap();
        let remaining = replay(&conn, "client-a", 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event, events[1]);
    }

    #[tokio::test]
    async fn compact_only_drops_fully_acknowledged_entries() {
        let store = Store::open_in_memory().await.unwrap();
        crate::storage::init(&store).await.unwrap();
        let conn = store.connection().unwrap();

        let events = vec![ChangeEvent::CollectionAdded { collection_id: CollectionId(1) }];
        record(&conn, &events).await.unwrap();
        let entries = replay(&conn, "client-a", 10).await.unwrap();
        acknowledge(&conn, "client-a", entries[0].offset).await.unwrap();
        acknowledge(&conn, "client-b", 0).await.unwrap();

        let dropped = compact(&conn).await.unwrap();
        assert_eq!(dropped, 0, "client-b hasn't acknowledged yet");
    }
}
