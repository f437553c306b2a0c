//! Item Sync (spec §4.8): reconciles a collection's items against a remote
//! listing in batches, each batch its own transaction so a failure on one
//! batch never loses progress already committed by earlier ones.

use std::collections::HashSet;

use chrono::{SubsecRound, Utc};
use pim_api::wire::{ChangeEvent, PartInput};
use pim_api::{AttributeMap, CollectionId, EngineError};
use pim_core::Item;

use crate::cancel::CancelToken;
use crate::errors::Result;
use crate::parts::PartStreamer;
use crate::storage::repo;
use crate::transaction::Session;

fn now() -> String {
    Utc::now().trunc_subsecs(0).to_rfc3339()
}

/// Which field(s) identify a remote item as the same local item (spec §4.8
/// step 1). Full syncs always match by `remote_id`, regardless of mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    Rid,
    Gid,
    RidOrGid,
}

#[derive(Clone)]
pub struct RemoteItem {
    pub remote_id: String,
    pub gid: String,
    pub mime_type: String,
    pub flags: HashSet<String>,
    pub attributes: AttributeMap,
    pub parts: Vec<PartInput>,
    pub size_hint: i64,
}

pub struct SyncInput {
    pub destination: CollectionId,
    pub merge_mode: MergeMode,
    pub items: Vec<RemoteItem>,
    /// `false` = full listing: anything local not named here is removed.
    pub incremental: bool,
    /// Incremental-only: remote_ids the provider reports as deleted.
    pub removed: Vec<String>,
    pub batch_size: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Non-fatal: a Gid-without-Rid match found more than one local peer
    /// (spec §4.8 step 1); one was kept, the rest flagged for a later pass.
    pub duplicate_warnings: Vec<String>,
    /// One entry per batch that failed; the batch's writes were rolled
    /// back but processing continued with the next batch.
    pub batch_errors: Vec<String>,
    pub canceled: bool,
}

impl SyncReport {
    pub fn failed(&self) -> bool {
        self.canceled || !self.batch_errors.is_empty()
    }
}

/// Runs the full job to completion (or to the point of cancellation).
/// Returns the report plus every event committed by a successful batch;
/// the caller forwards those to the change stream.
pub async fn sync(
    session: &mut Session,
    streamer: &PartStreamer,
    cancel: &CancelToken,
    input: SyncInput,
) -> Result<(SyncReport, Vec<ChangeEvent>)> {
    let mut report = SyncReport::default();
    let mut events = Vec::new();
    let batch_size = input.batch_size.max(1);

    // A duplicate remote-id/gid *within the same submitted listing* names
    // the same remote item twice (a provider quirk, distinct from the
    // "more than one local peer" case below); the last occurrence wins so
    // it processes as a single modify, not two.
    let items = dedupe_listing(input.items, input.merge_mode);

    for chunk in items.chunks(batch_size) {
        if cancel.is_canceled() {
            report.canceled = true;
            break;
        }
        match run_batch(session, streamer, input.destination, input.merge_mode, &mut report, chunk).await {
            Ok(batch_events) => events.extend(batch_events),
            Err(e) => report.batch_errors.push(e.to_string()),
        }
    }

    if !report.canceled {
        if input.incremental {
            match apply_removed(session, &input.removed, &mut report).await {
                Ok(more) => events.extend(more),
                Err(e) => report.batch_errors.push(e.to_string()),
            }
        } else if report.batch_errors.is_empty() {
            let listed: HashSet<&str> = items
                .iter()
                .map(|i| i.remote_id.as_str())
                .filter(|rid| !rid.is_empty())
                .collect();
            match remove_untouched(session, input.destination, &listed, &mut report).await {
                Ok(more) => events.extend(more),
                Err(e) => report.batch_errors.push(e.to_string()),
            }
        }
    }

    if report.canceled {
        return Err(EngineError::UserCanceled);
    }
    Ok((report, events))
}

async fn run_batch(
    session: &mut Session,
    streamer: &PartStreamer,
    destination: CollectionId,
    mode: MergeMode,
    report: &mut SyncReport,
    items: &[RemoteItem],
) -> Result<Vec<ChangeEvent>> {
    session.begin().await?;
    match apply_batch(session, streamer, destination, mode, report, items).await {
        Ok(()) => session.commit().await,
        Err(e) => {
            let _ = session.rollback().await;
            Err(e)
        }
    }
}

async fn apply_batch(
    session: &mut Session,
    streamer: &PartStreamer,
    destination: CollectionId,
    mode: MergeMode,
    report: &mut SyncReport,
    items: &[RemoteItem],
) -> Result<()> {
    for remote in items {
        let conn = session.conn()?;
        let peers = find_peers(conn, destination, remote, mode).await?;
        match peers.split_first() {
            None => {
                create_item(session, streamer, destination, remote).await?;
                report.created += 1;
            }
            Some((keep, dups)) => {
                for dup in dups {
                    report.duplicate_warnings.push(format!(
                        "item {} is a duplicate peer of {} for rid {:?} gid {:?}",
                        dup.id, keep.id, remote.remote_id, remote.gid,
                    ));
                }
                modify_item(session, streamer, keep, remote).await?;
                report.updated += 1;
            }
        }
    }
    Ok(())
}

fn merge_key(item: &RemoteItem, mode: MergeMode) -> String {
    match mode {
        MergeMode::Rid => format!("rid:{}", item.remote_id),
        MergeMode::Gid => format!("gid:{}", item.gid),
        MergeMode::RidOrGid => {
            if !item.remote_id.is_empty() {
                format!("rid:{}", item.remote_id)
            } else {
                format!("gid:{}", item.gid)
            }
        }
    }
}

fn dedupe_listing(items: Vec<RemoteItem>, mode: MergeMode) -> Vec<RemoteItem> {
    let mut order = Vec::new();
    let mut by_key: std::collections::HashMap<String, RemoteItem> = std::collections::HashMap::new();
    for item in items {
        let key = merge_key(&item, mode);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, item);
    }
    order
        .into_iter()
        .map(|k| by_key.remove(&k).expect("key was just inserted"))
        .collect()
}

async fn find_peers(
    conn: &turso::Connection,
    destination: CollectionId,
    remote: &RemoteItem,
    mode: MergeMode,
) -> Result<Vec<Item>> {
    match mode {
        MergeMode::Rid => Ok(repo::find_item_by_remote_id(conn, destination, &remote.remote_id)
            .await?
            .into_iter()
            .collect()),
        MergeMode::Gid => repo::find_items_by_gid(conn, destination, &remote.gid).await,
        MergeMode::RidOrGid => {
            if !remote.remote_id.is_empty() {
                if let Some(item) = repo::find_item_by_remote_id(conn, destination, &remote.remote_id).await? {
                    return Ok(vec![item]);
                }
            }
            repo::find_items_by_gid(conn, destination, &remote.gid).await
        }
    }
}

async fn create_item(
    session: &mut Session,
    streamer: &PartStreamer,
    destination: CollectionId,
    remote: &RemoteItem,
) -> Result<()> {
    let part_size_sum: i64 = remote.parts.iter().map(|p| p.data.len() as i64).sum();
    let size = remote.size_hint.max(part_size_sum);
    let conn = session.conn()?;
    let item_id = repo::insert_item(
        conn,
        repo::NewItem {
            collection_id: destination,
            mime_type: &remote.mime_type,
            remote_id: &remote.remote_id,
            remote_revision: "",
            gid: &remote.gid,
            size,
            flags: &remote.flags,
            attributes: &remote.attributes,
        },
    )
    .await?;
    store_parts(session, streamer, item_id, 0, &remote.parts).await?;
    session.push_event(ChangeEvent::ItemAdded { item_id, collection_id: destination })?;
    Ok(())
}

async fn modify_item(
    session: &mut Session,
    streamer: &PartStreamer,
    existing: &Item,
    remote: &RemoteItem,
) -> Result<()> {
    let mut flags = existing.flags.clone();
    flags.extend(remote.flags.iter().cloned());

    let part_size_sum: i64 = remote.parts.iter().map(|p| p.data.len() as i64).sum();
    let size = remote.size_hint.max(part_size_sum).max(existing.size);
    let modified = now();

    let conn = session.conn()?;
    repo::patch_item(
        conn,
        existing.id,
        repo::ItemPatch {
            remote_id: Some(&remote.remote_id),
            remote_revision: None,
            gid: Some(&remote.gid),
            size: Some(size),
            flags: Some(&flags),
            clear_dirty: false,
            bump_revision: !remote.parts.is_empty(),
            modified: &modified,
        },
    )
    .await?;

    if !remote.attributes.is_empty() {
        let mut attrs = existing.attributes.clone();
        for (k, v) in &remote.attributes {
            attrs.insert(k.clone(), v.clone());
        }
        conn.execute(
            "UPDATE items SET attributes = ? WHERE id = ?",
            turso::params![crate::storage::codec::encode_attributes(&attrs), existing.id.get()],
        )
        .await?;
    }

    let mut changed_parts = HashSet::new();
    for part in &remote.parts {
        changed_parts.insert(part.name.clone());
    }
    store_parts(session, streamer, existing.id, existing.revision + 1, &remote.parts).await?;

    session.push_event(ChangeEvent::ItemChanged {
        item_id: existing.id,
        collection_id: existing.collection_id,
        changed_parts,
    })?;
    Ok(())
}

async fn store_parts(
    session: &mut Session,
    streamer: &PartStreamer,
    item_id: pim_api::ItemId,
    revision: i64,
    parts: &[PartInput],
) -> Result<()> {
    for part in parts {
        let tx = session.transaction_mut().ok_or(EngineError::NoTransaction)?;
        let stored = streamer.store(tx, item_id, revision, &part.name, &part.data).await?;
        let conn = session.conn()?;
        repo::upsert_part(
            conn,
            item_id,
            &part.name,
            stored.data.as_deref(),
            stored.storage,
            stored.external_ref.as_deref(),
            part.data.len() as i64,
        )
        .await?;
    }
    Ok(())
}

/// Incremental removal: apply the provider's `removed` list by rid,
/// silently ignoring rids with no local match (spec §4.8 step 3).
async fn apply_removed(
    session: &mut Session,
    removed: &[String],
    report: &mut SyncReport,
) -> Result<Vec<ChangeEvent>> {
    if removed.is_empty() {
        return Ok(Vec::new());
    }
    session.begin().await?;
    let result = async {
        for rid in removed {
            if rid.is_empty() {
                continue;
            }
            let conn = session.conn()?;
            let filter = pim_core::Filter::Eq("remote_id".into(), pim_api::Value::String(rid.clone()));
            for item in repo::find_items(conn, &filter).await? {
                let conn = session.conn()?;
                repo::delete_parts_for_item(conn, item.id).await?;
                repo::delete_item_row(conn, item.id).await?;
                session.push_event(ChangeEvent::ItemRemoved {
                    item_id: item.id,
                    collection_id: item.collection_id,
                })?;
                report.deleted += 1;
            }
        }
        Ok::<(), EngineError>(())
    }
    .await;
    match result {
        Ok(()) => session.commit().await,
        Err(e) => {
            let _ = session.rollback().await;
            Err(e)
        }
    }
}

/// Full-sync cleanup: anything in `destination` whose rid wasn't present
/// in the remote listing is removed (spec §4.8 step 2).
async fn remove_untouched(
    session: &mut Session,
    destination: CollectionId,
    listed: &HashSet<&str>,
    report: &mut SyncReport,
) -> Result<Vec<ChangeEvent>> {
    session.begin().await?;
    let result = async {
        let conn = session.conn()?;
        let stale: Vec<_> = repo::items_in_collection(conn, destination)
            .await?
            .into_iter()
            .filter(|item| !item.remote_id.is_empty() && !listed.contains(item.remote_id.as_str()))
            .collect();
        for item in stale {
            let conn = session.conn()?;
            repo::delete_parts_for_item(conn, item.id).await?;
            repo::delete_item_row(conn, item.id).await?;
            session.push_event(ChangeEvent::ItemRemoved {
                item_id: item.id,
                collection_id: item.collection_id,
            })?;
            report.deleted += 1;
        }
        Ok::<(), EngineError>(())
    }
    .await;
    match result {
        Ok(()) => session.commit().await,
        Err(e) => {
            let _ = session.rollback().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use std::sync::Arc;

    async fn setup() -> (Session, CollectionId, PartStreamer, tempfile::TempDir) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let streamer = PartStreamer::new(dir.path(), 1_000_000);
        let mut session = Session::new(store.clone());
        session.begin().await.unwrap();
        let conn = session.conn().unwrap();
        let resource_id = repo::create_resource(conn, "res1", false).await.unwrap();
        let root = repo::create_collection(
            conn,
            repo::NewCollection {
                parent_id: None,
                name: "foo",
                resource_id,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &HashSet::new(),
                cache_policy: &pim_core::CachePolicy::default(),
                is_virtual: false,
                attributes: &AttributeMap::new(),
            },
        )
        .await
        .unwrap();
        session.commit().await.unwrap();
        (session, root, streamer, dir)
    }

    fn remote(rid: &str) -> RemoteItem {
        RemoteItem {
            remote_id: rid.to_string(),
            gid: String::new(),
            mime_type: "text/plain".into(),
            flags: HashSet::new(),
            attributes: AttributeMap::new(),
            parts: vec![PartInput { name: "PLD:RFC822".into(), data: b"hi".to_vec() }],
            size_hint: 2,
        }
    }

    #[tokio::test]
    async fn full_sync_collapses_duplicate_remote_id_in_listing() {
        let (mut session, destination, streamer, _dir) = setup().await;
        let cancel = CancelToken::new();

        let mut items: Vec<RemoteItem> = (0..15).map(|i| remote(&format!("rid-{i}"))).collect();
        let (report, _events) = sync(
            &mut session,
            &streamer,
            &cancel,
            SyncInput {
                destination,
                merge_mode: MergeMode::Rid,
                items: items.clone(),
                incremental: false,
                removed: Vec::new(),
                batch_size: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.created, 15);

        // Re-submit the same 15 plus one duplicate remote-id.
        items.push(remote("rid-0"));
        let (report, _events) = sync(
            &mut session,
            &streamer,
            &cancel,
            SyncInput {
                destination,
                merge_mode: MergeMode::Rid,
                items,
                incremental: false,
                removed: Vec::new(),
                batch_size: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.updated, 15);
        assert_eq!(report.created, 0);
        assert_eq!(report.deleted, 0);

        let conn = session.store().connection().unwrap();
        let remaining = repo::items_in_collection(&conn, destination).await.unwrap();
        assert_eq!(remaining.len(), 15);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_batch() {
        let (mut session, destination, streamer, _dir) = setup().await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = sync(
            &mut session,
            &streamer,
            &cancel,
            SyncInput {
                destination,
                merge_mode: MergeMode::Rid,
                items: vec![remote("rid-0")],
                incremental: false,
                removed: Vec::new(),
                batch_size: 10,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::UserCanceled));
    }
}
