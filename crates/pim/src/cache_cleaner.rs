//! Cache Cleaner & Interval Checker (spec §5, §9): background eviction of
//! expired cached payloads, paused whenever an in-flight operation needs
//! the cache to stay warm, plus a scheduler that turns `cache_policy`
//! into periodic resync jobs.
//!
//! Mirrors the teacher's `QueryableCache::ingest_change_stream` shape
//! (`holon::core::stream_cache`): a `tokio::spawn`ed loop driven by
//! `tokio::time::interval`, not wired up on wasm32.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use turso::params;

use crate::errors::Result;
use crate::storage::Store;

/// Reference-counted pause on eviction (spec §9: "each in-flight operation
/// that needs the cache warm holds a guard; the cleaner pauses while
/// count > 0"). Acquire/release is exception-safe: [`InhibitGuard::drop`]
/// always releases, even if the holder panics or is canceled.
#[derive(Clone)]
pub struct Inhibitor {
    count: Arc<AtomicU64>,
}

impl Inhibitor {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_inhibited(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    pub fn acquire(&self) -> InhibitGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InhibitGuard { count: self.count.clone() }
    }
}

impl Default for Inhibitor {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InhibitGuard {
    count: Arc<AtomicU64>,
}

impl Drop for InhibitGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deletes cached part payloads whose collection's `cache_timeout_minutes`
/// has elapsed since the owning item was last modified. `-1` means
/// "forever" and is never evicted. Returns the number of parts cleared.
///
/// Only `Internal`/`External` parts are touched — `Foreign` parts point at
/// caller-owned storage the engine doesn't manage (spec §4.5).
pub async fn sweep_expired(store: &Store) -> Result<u64> {
    let conn = store.connection()?;
    let now = Utc::now();

    let mut stmt = conn
        .prepare(
            "SELECT p.item_id, p.name, i.modified, c.cache_policy
             FROM parts p
             JOIN items i ON i.id = p.item_id
             JOIN collections c ON c.id = i.collection_id
             WHERE p.storage IN ('internal', 'external') AND p.name LIKE 'PLD:%'",
        )
        .await?;
    let mut rows = stmt.query(()).await?;

    let mut expired = Vec::new();
    while let Some(row) = rows.next().await? {
        let item_id = row.get::<i64>(0)?;
        let name = row.get::<String>(1)?;
        let modified = row.get::<String>(2)?;
        let cache_policy_json = row.get::<String>(3)?;

        let policy = crate::storage::codec::decode_cache_policy(&cache_policy_json);
        if policy.cache_timeout_minutes < 0 {
            continue;
        }
        let Ok(modified_at) = modified.parse::<chrono::DateTime<Utc>>() else {
            continue;
        };
        let age = now.signed_duration_since(modified_at);
        if age > chrono::Duration::minutes(policy.cache_timeout_minutes) {
            expired.push((item_id, name));
        }
    }

    let mut cleared = 0u64;
    for (item_id, name) in expired {
        // Drop the row entirely rather than flip `storage`: an evicted
        // part is indistinguishable from one never fetched, which is
        // exactly how the Item Retriever decides what's missing.
        conn.execute(
            "DELETE FROM parts WHERE item_id = ? AND name = ?",
            params![item_id, name],
        )
        .await?;
        cleared += 1;
    }
    Ok(cleared)
}

/// Spawns the background eviction loop. Returns a handle the embedder can
/// abort on shutdown. A no-op on wasm32, same as the teacher's stream
/// ingestion (background tasks need a multi-threaded executor).
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn(store: Arc<Store>, inhibitor: Inhibitor, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if inhibitor.is_inhibited() {
                tracing::debug!("cache cleaner tick skipped: inhibited");
                continue;
            }
            match sweep_expired(&store).await {
                Ok(cleared) if cleared > 0 => tracing::info!(cleared, "cache cleaner evicted expired parts"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "cache cleaner sweep failed"),
            }
        }
    })
}

/// A collection whose `check_interval_minutes` has elapsed and is due for
/// a resync. The interval checker only *produces* these; it never mutates
/// anything itself (spec §9).
#[derive(Debug, PartialEq)]
pub struct DueCollection {
    pub collection_id: pim_api::CollectionId,
}

/// Finds collections due for a resync, i.e. whose last sync was more than
/// `cache_policy.check_interval_minutes` ago. `-1` means "never check".
pub async fn due_for_resync(store: &Store) -> Result<Vec<DueCollection>> {
    let conn = store.connection()?;
    let now = Utc::now();

    let mut stmt = conn
        .prepare("SELECT id, cache_policy, last_synced FROM collections WHERE enabled = 1")
        .await?;
    let mut rows = stmt.query(()).await?;

    let mut due = Vec::new();
    while let Some(row) = rows.next().await? {
        let id = row.get::<i64>(0)?;
        let cache_policy_json = row.get::<String>(1)?;
        let last_synced = row.get::<Option<String>>(2)?;

        let policy = crate::storage::codec::decode_cache_policy(&cache_policy_json);
        if policy.check_interval_minutes < 0 {
            continue;
        }
        let is_due = match last_synced.and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()) {
            None => true,
            Some(last) => now.signed_duration_since(last) > chrono::Duration::minutes(policy.check_interval_minutes),
        };
        if is_due {
            due.push(DueCollection {
                collection_id: pim_api::CollectionId(id),
            });
        }
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inhibitor_pauses_only_while_guards_held() {
        let inhibitor = Inhibitor::new();
        assert!(!inhibitor.is_inhibited());
        let guard_a = inhibitor.acquire();
        assert!(inhibitor.is_inhibited());
        let guard_b = inhibitor.acquire();
        drop(guard_a);
        assert!(inhibitor.is_inhibited(), "guard_b still held");
        drop(guard_b);
        assert!(!inhibitor.is_inhibited());
    }
}
