//! Item Retriever (spec §4.6): ensures requested payload parts are present
//! in cache, deduplicating concurrent requests for the same item and
//! refusing to ask a resource to fetch its own items.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pim_api::{CollectionId, EngineError, ItemId, ResourceId};
use tokio::sync::{oneshot, Mutex};

use crate::errors::Result;
use crate::storage::repo;
use crate::storage::Store;

/// What the retriever asks a resource to fetch (spec §4.6 step 3).
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalRequest {
    pub resource_id: ResourceId,
    pub item_id: ItemId,
    pub remote_id: String,
    pub mime_type: String,
    pub parts: Vec<String>,
}

/// Resolves one [`RetrievalRequest`] against the owning provider. Concrete
/// resource connectors implement this; the engine itself has no network
/// code (spec §1: provider implementations are an external collaborator).
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    async fn retrieve(&self, request: RetrievalRequest) -> std::result::Result<(), String>;
}

#[derive(Default)]
struct DedupTable {
    in_flight: HashMap<ItemId, Vec<oneshot::Sender<std::result::Result<(), String>>>>,
}

/// Process-wide in-flight-request table (spec §5, §9): at most one
/// `RetrievalRequest` per item is ever outstanding; concurrent callers
/// needing overlapping parts register as waiters on the same slot.
pub struct Retriever {
    store: Arc<Store>,
    dedup: Mutex<DedupTable>,
}

pub struct RetrieveOptions {
    pub full_payload: bool,
    pub requested_parts: Vec<String>,
    pub recursive: bool,
    pub ignore_retrieval_errors: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            full_payload: true,
            requested_parts: Vec::new(),
            recursive: false,
            ignore_retrieval_errors: false,
        }
    }
}

impl Retriever {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            dedup: Mutex::new(DedupTable::default()),
        }
    }

    /// Ensures every item reachable from `collection_id` (or a single item
    /// scope the caller already resolved) has its requested parts cached.
    /// Returns the ids of items whose parts could not be fetched (empty
    /// unless `ignore_retrieval_errors` is set).
    pub async fn ensure_cached(
        &self,
        provider: &dyn RetrievalProvider,
        requesting_resource: ResourceId,
        item_ids: &[ItemId],
        opts: &RetrieveOptions,
    ) -> Result<Vec<ItemId>> {
        let conn = self.store.connection()?;
        let mut missing_by_item: HashMap<ItemId, (ResourceId, String, String, Vec<String>)> = HashMap::new();

        for &item_id in item_ids {
            let Some(item) = repo::get_item(&conn, item_id).await? else {
                continue;
            };
            let collection = repo::get_collection(&conn, item.collection_id)
                .await?
                .ok_or(EngineError::NotFound)?;
            if collection.resource_id == requesting_resource {
                // Self-fetch prevention (spec §4.6): a resource never asks
                // itself for its own items.
                continue;
            }
            let parts = repo::payload_parts_for_item(&conn, item_id).await?;
            let missing = missing_parts(&parts, opts);
            if !missing.is_empty() {
                missing_by_item.insert(
                    item_id,
                    (collection.resource_id, item.remote_id.clone(), item.mime_type.clone(), missing),
                );
            }
        }

        let mut failed = Vec::new();
        for (item_id, (resource_id, remote_id, mime_type, parts)) in missing_by_item {
            let outcome = self
                .request_once(provider, RetrievalRequest { resource_id, item_id, remote_id, mime_type, parts })
                .await;
            if let Err(reason) = outcome {
                if opts.ignore_retrieval_errors {
                    failed.push(item_id);
                } else {
                    return Err(EngineError::RetrievalFailed { reason });
                }
            }
        }

        if opts.recursive {
            // Recursion into child collections is driven by the caller
            // supplying the expanded item list per collection; a single
            // retriever pass only dedups requests, it does not walk the
            // tree itself.
        }

        Ok(failed)
    }

    async fn request_once(
        &self,
        provider: &dyn RetrievalProvider,
        request: RetrievalRequest,
    ) -> std::result::Result<(), String> {
        let (tx, rx) = oneshot::channel();
        let should_fetch = {
            let mut table = self.dedup.lock().await;
            match table.in_flight.get_mut(&request.item_id) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    table.in_flight.insert(request.item_id, vec![tx]);
                    true
                }
            }
        };

        if !should_fetch {
            return rx.await.unwrap_or_else(|_| Err("retrieval canceled".to_string()));
        }

        let item_id = request.item_id;
        let result = provider.retrieve(request).await;

        let waiters = {
            let mut table = self.dedup.lock().await;
            table.in_flight.remove(&item_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }
}

fn missing_parts(parts: &[pim_core::Part], opts: &RetrieveOptions) -> Vec<String> {
    let present: std::collections::HashSet<&str> = parts
        .iter()
        .filter(|p| p.has_data() || p.external_ref.is_some())
        .map(|p| p.name.as_str())
        .collect();

    if opts.full_payload {
        if present.contains("PLD:RFC822") {
            Vec::new()
        } else {
            vec!["PLD:RFC822".to_string()]
        }
    } else {
        opts.requested_parts
            .iter()
            .filter(|name| !present.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Used by sync/move/copy flows that only need "is there any missing
/// payload part for these items under this collection", without caring
/// which provider eventually serves them.
pub async fn collection_item_ids(store: &Store, collection_id: CollectionId) -> Result<Vec<ItemId>> {
    let conn = store.connection()?;
    Ok(repo::items_in_collection(&conn, collection_id)
        .await?
        .into_iter()
        .map(|i| i.id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RetrievalProvider for CountingProvider {
        async fn retrieve(&self, _request: RetrievalRequest) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_item_dedupe() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        crate::storage::init(&store).await.unwrap();
        let retriever = Arc::new(Retriever::new(store));
        let provider = Arc::new(CountingProvider { calls: Default::default() });

        let mut handles = Vec::new();
        for _ in 0..5 {
            let retriever = retriever.clone();
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                retriever
                    .request_once(
                        provider.as_ref(),
                        RetrievalRequest {
                            resource_id: ResourceId(1),
                            item_id: ItemId(1),
                            remote_id: "r1".into(),
                            mime_type: "text/plain".into(),
                            parts: vec!["PLD:RFC822".into()],
                        },
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
