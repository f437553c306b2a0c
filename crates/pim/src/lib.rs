//! Embeddable PIM storage/sync engine (spec §1, §6): no daemon, no CLI,
//! no network I/O of its own. An embedder constructs an [`Engine`], feeds
//! it [`pim_api::wire::Command`]s, and drains [`pim_api::wire::ChangeEvent`]s
//! from the change stream it gets back.

pub mod cache_cleaner;
pub mod cancel;
pub mod change_recorder;
pub mod commands;
pub mod config;
pub mod errors;
pub mod notify;
pub mod parts;
pub mod retriever;
pub mod scope_resolver;
pub mod storage;
pub mod sync;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use pim_api::wire::{Command, Response};
use pim_api::ResourceId;

use cache_cleaner::Inhibitor;
use config::{DatabaseLocation, EngineConfig};
use errors::Result;
use parts::PartStreamer;
use retriever::Retriever;
use storage::Store;
use transaction::Session;

/// Owns the storage pool, the part streamer, the retrieval dedup table and
/// the cache-cleaner inhibitor. One `Engine` per embedding process; each
/// client session gets its own [`Session`] (spec §4.2: "sessions never
/// share an in-flight transaction").
pub struct Engine {
    store: Arc<Store>,
    streamer: PartStreamer,
    retriever: Retriever,
    inhibitor: Inhibitor,
    config: EngineConfig,
    #[cfg(not(target_arch = "wasm32"))]
    cleaner_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Opens the backing store and runs the DDL (idempotent). Does not
    /// start the background cache cleaner — call [`Engine::spawn_cache_cleaner`]
    /// once the caller is ready to receive eviction activity.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let store = match &config.database {
            DatabaseLocation::Memory => Store::open_in_memory().await?,
            DatabaseLocation::File(path) => Store::open_file(path).await?,
        };
        storage::init(&store).await?;
        let store = Arc::new(store);
        let streamer = PartStreamer::new(config.staging_dir.clone(), config.external_part_threshold);
        Ok(Self {
            store: store.clone(),
            streamer,
            retriever: Retriever::new(store),
            inhibitor: Inhibitor::new(),
            config,
            #[cfg(not(target_arch = "wasm32"))]
            cleaner_handle: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn inhibitor(&self) -> &Inhibitor {
        &self.inhibitor
    }

    pub fn part_streamer(&self) -> &PartStreamer {
        &self.streamer
    }

    /// Starts the periodic eviction sweep (spec §5, §9). Aborted when the
    /// returned handle (kept on `self`) is dropped along with the engine.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn spawn_cache_cleaner(&mut self, interval: Duration) {
        let handle = cache_cleaner::spawn(self.store.clone(), self.inhibitor.clone(), interval);
        self.cleaner_handle = Some(handle);
    }

    /// Opens a new client session bound to this engine's store.
    pub fn new_session(&self) -> Session {
        Session::new(self.store.clone())
    }

    /// Runs one command against `session` to completion, returning exactly
    /// one response (spec §4.4). Change Recorder delivery is the caller's
    /// job wherever it holds the drained events directly — the sync
    /// engines and explicit `CommitTx` both do (spec §4.3) — `dispatch`
    /// itself has no events to hand back for single-command auto-commit.
    pub async fn handle(
        &self,
        session: &mut Session,
        caller_resource: Option<ResourceId>,
        command: Command,
    ) -> Response {
        commands::dispatch(session, &self.streamer, caller_resource, command).await
    }

    /// Appends `events` to the durable Change Recorder log (spec §4.3).
    /// Callers holding a `Vec<ChangeEvent>` from `Session::commit` (the
    /// sync engines, an explicit `CommitTx`) pass it here before
    /// forwarding the events to subscribers.
    pub async fn record_changes(&self, events: &[pim_api::wire::ChangeEvent]) -> Result<()> {
        let conn = self.store.connection()?;
        change_recorder::record(&conn, events).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        #[cfg(not(target_arch = "wasm32"))]
        if let Some(handle) = self.cleaner_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_runs_schema_and_yields_a_usable_session() {
        let engine = Engine::open(EngineConfig::in_memory()).await.unwrap();
        let mut session = engine.new_session();
        session.begin().await.unwrap();
        session.commit().await.unwrap();
    }
}
