//! Recursive Mover (spec §4.9): replays an inter-resource collection move
//! toward the destination resource as a depth-first sequence of
//! collection-added/item-added notifications.
//!
//! The caller is expected to have already fetched the subtree description
//! and each item's payload (e.g. via [`crate::retriever::Retriever`], with
//! the cache cleaner inhibited for the duration — spec §5) before calling
//! [`replay`]; this module only reconciles that snapshot against the
//! destination.

use std::collections::HashSet;

use pim_api::wire::{ChangeEvent, PartInput};
use pim_api::{AttributeMap, CollectionId, EngineError, ItemId, ResourceId};
use pim_core::CachePolicy;

use crate::errors::Result;
use crate::parts::PartStreamer;
use crate::storage::repo;
use crate::transaction::Session;

pub struct SubtreeItem {
    /// Empty if the source has no stable cross-resource identity for this
    /// item (spec §4.9: "items without a remote_id... are re-created").
    pub remote_id: String,
    pub gid: String,
    pub mime_type: String,
    pub flags: HashSet<String>,
    pub attributes: AttributeMap,
    pub parts: Vec<PartInput>,
}

pub struct SubtreeNode {
    pub name: String,
    pub content_mime_types: HashSet<String>,
    pub cache_policy: CachePolicy,
    pub attributes: AttributeMap,
    pub items: Vec<SubtreeItem>,
    pub children: Vec<SubtreeNode>,
}

pub struct MoveInput {
    pub source_resource: ResourceId,
    pub destination_parent: CollectionId,
    pub root: SubtreeNode,
}

#[derive(Debug, Default, PartialEq)]
pub struct MoveReport {
    pub collections_created: usize,
    pub items_created: usize,
    pub items_moved: usize,
}

pub async fn replay(
    session: &mut Session,
    streamer: &PartStreamer,
    input: MoveInput,
) -> Result<(MoveReport, Vec<ChangeEvent>)> {
    let implicit = session.ensure_open().await?;
    let result = replay_inner(session, streamer, &input).await;
    session.finish_implicit(implicit, result).await
}

async fn replay_inner(session: &mut Session, streamer: &PartStreamer, input: &MoveInput) -> Result<MoveReport> {
    let conn = session.conn()?;
    let destination_resource = repo::get_collection(conn, input.destination_parent)
        .await?
        .ok_or(EngineError::NotFound)?
        .resource_id;

    let mut report = MoveReport::default();
    // Explicit stack, not recursive async calls, so the walk doesn't need
    // boxed futures (same reasoning as Collection Sync's subtree delete).
    let mut stack: Vec<(CollectionId, &SubtreeNode)> = vec![(input.destination_parent, &input.root)];

    while let Some((parent_id, node)) = stack.pop() {
        let conn = session.conn()?;
        let new_id = repo::create_collection(
            conn,
            repo::NewCollection {
                parent_id: Some(parent_id),
                name: &node.name,
                resource_id: destination_resource,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &node.content_mime_types,
                cache_policy: &node.cache_policy,
                is_virtual: false,
                attributes: &node.attributes,
            },
        )
        .await?;
        report.collections_created += 1;
        session.push_event(ChangeEvent::CollectionAdded { collection_id: new_id })?;
        session.note_child_operation().await?;

        for item in &node.items {
            replay_item(
                session,
                streamer,
                input.source_resource,
                destination_resource,
                new_id,
                item,
                &mut report,
            )
            .await?;
        }

        for child in node.children.iter().rev() {
            stack.push((new_id, child));
        }
    }
    Ok(report)
}

async fn replay_item(
    session: &mut Session,
    streamer: &PartStreamer,
    source_resource: ResourceId,
    destination_resource: ResourceId,
    destination_collection: CollectionId,
    item: &SubtreeItem,
    report: &mut MoveReport,
) -> Result<()> {
    if item.remote_id.is_empty() {
        create_new_item(session, streamer, destination_collection, "", item, report).await?;
        session.note_child_operation().await?;
        return Ok(());
    }

    let conn = session.conn()?;
    let filter = pim_core::Filter::Eq("remote_id".into(), pim_api::Value::String(item.remote_id.clone()));
    let existing = repo::find_items(conn, &filter).await?.into_iter().next();

    match existing {
        // Already a local row: this is the "normal cross-resource
        // item-moved path" (spec §4.4/§4.9) — reassign in place rather
        // than duplicate.
        Some(found) => {
            let source_collection = found.collection_id;
            let conn = session.conn()?;
            repo::set_item_collection(conn, found.id, destination_collection).await?;
            if source_resource != destination_resource {
                repo::set_item_dirty(conn, found.id, true).await?;
            }
            session.push_event(ChangeEvent::ItemsMoved {
                item_ids: vec![found.id],
                source_collection,
                dest_collection: destination_collection,
            })?;
            if source_resource != destination_resource {
                let conn = session.conn()?;
                repo::clear_item_remote_id(conn, found.id).await?;
            }
            report.items_moved += 1;
        }
        // No local row carries this remote_id: the snapshot came from a
        // store this engine doesn't otherwise see, so the item is created
        // fresh, keeping its remote_id intact.
        None => {
            create_new_item(session, streamer, destination_collection, &item.remote_id, item, report).await?;
        }
    }
    session.note_child_operation().await?;
    Ok(())
}

async fn create_new_item(
    session: &mut Session,
    streamer: &PartStreamer,
    destination_collection: CollectionId,
    remote_id: &str,
    item: &SubtreeItem,
    report: &mut MoveReport,
) -> Result<()> {
    let size: i64 = item.parts.iter().map(|p| p.data.len() as i64).sum();
    let conn = session.conn()?;
    let item_id = repo::insert_item(
        conn,
        repo::NewItem {
            collection_id: destination_collection,
            mime_type: &item.mime_type,
            remote_id,
            remote_revision: "",
            gid: &item.gid,
            size,
            flags: &item.flags,
            attributes: &item.attributes,
        },
    )
    .await?;
    store_parts(session, streamer, item_id, 0, &item.parts).await?;
    session.push_event(ChangeEvent::ItemAdded { item_id, collection_id: destination_collection })?;
    report.items_created += 1;
    Ok(())
}

async fn store_parts(
    session: &mut Session,
    streamer: &PartStreamer,
    item_id: ItemId,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use std::sync::Arc;

    fn leaf(remote_id: &str) -> SubtreeNode {
        SubtreeNode {
            name: "bla".into(),
            content_mime_types: HashSet::new(),
            cache_policy: CachePolicy::default(),
            attributes: AttributeMap::new(),
            items: vec![SubtreeItem {
                remote_id: remote_id.to_string(),
                gid: String::new(),
                mime_type: "text/plain".into(),
                flags: HashSet::new(),
                attributes: AttributeMap::new(),
                parts: vec![PartInput { name: "PLD:RFC822".into(), data: b"payload".to_vec() }],
            }],
            children: Vec::new(),
        }
    }

    #[tokio::test]
    async fn recreates_items_without_remote_id() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut session = Session::new(store);
        session.begin().await.unwrap();
        let conn = session.conn().unwrap();
        let source = repo::create_resource(conn, "res1", false).await.unwrap();
        let destination_resource = repo::create_resource(conn, "res2", false).await.unwrap();
        let destination_parent = repo::create_collection(
            conn,
            repo::NewCollection {
                parent_id: None,
                name: "root",
                resource_id: destination_resource,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &HashSet::new(),
                cache_policy: &CachePolicy::default(),
                is_virtual: false,
                attributes: &AttributeMap::new(),
            },
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let streamer = PartStreamer::new(dir.path(), 1_000_000);
        let (report, _events) = replay(
            &mut session,
            &streamer,
            MoveInput {
                source_resource: source,
                destination_parent,
                root: leaf(""),
            },
        )
        .await
        .unwrap();

        assert_eq!(report.collections_created, 1);
        assert_eq!(report.items_created, 1);
        assert_eq!(report.items_moved, 0);
    }

    #[tokio::test]
    async fn moves_existing_item_in_place_when_remote_id_matches() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut session = Session::new(store);
        session.begin().await.unwrap();
        let conn = session.conn().unwrap();
        let source = repo::create_resource(conn, "res1", false).await.unwrap();
        let old_collection = repo::create_collection(
            conn,
            repo::NewCollection {
                parent_id: None,
                name: "foo",
                resource_id: source,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &HashSet::new(),
                cache_policy: &CachePolicy::default(),
                is_virtual: false,
                attributes: &AttributeMap::new(),
            },
        )
        .await
        .unwrap();
        let item_id = repo::insert_item(
            conn,
            repo::NewItem {
                collection_id: old_collection,
                mime_type: "text/plain",
                remote_id: "r1",
                remote_revision: "",
                gid: "",
                size: 0,
                flags: &HashSet::new(),
                attributes: &AttributeMap::new(),
            },
        )
        .await
        .unwrap();
        let destination_resource = repo::create_resource(conn, "res2", false).await.unwrap();
        let destination_parent = repo::create_collection(
            conn,
            repo::NewCollection {
                parent_id: None,
                name: "root",
                resource_id: destination_resource,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &HashSet::new(),
                cache_policy: &CachePolicy::default(),
                is_virtual: false,
                attributes: &AttributeMap::new(),
            },
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let streamer = PartStreamer::new(dir.path(), 1_000_000);
        let (report, _events) = replay(
            &mut session,
            &streamer,
            MoveInput {
                source_resource: source,
                destination_parent,
                root: leaf("r1"),
            },
        )
        .await
        .unwrap();

        assert_eq!(report.items_moved, 1);
        assert_eq!(report.items_created, 0);

        let conn = session.store().connection().unwrap();
        let moved = repo::get_item(&conn, item_id).await.unwrap().unwrap();
        assert!(moved.remote_id.is_empty(), "remote_id cleared after cross-resource move");
        assert_ne!(moved.collection_id, old_collection);
    }
}
