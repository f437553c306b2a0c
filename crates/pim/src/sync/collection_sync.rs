//! Collection Sync (spec §4.7): reconciles a provider's collection listing
//! against the local tree. Keyed by rid rather than hrid directly — a
//! hierarchical chain is just a remote node whose `parent_rid` happens to
//! be another remote node's rid, so both the flat and hierarchical cases
//! share one topological walk.

use std::collections::{HashMap, HashSet};

use pim_api::wire::ChangeEvent;
use pim_api::{AttributeMap, CollectionId, EngineError, ResourceId};
use pim_core::CachePolicy;

use crate::errors::Result;
use crate::storage::repo;
use crate::transaction::Session;

#[derive(Clone, Debug)]
pub struct RemoteCollectionNode {
    pub rid: String,
    /// `None` for a root node (attaches directly under the resource's root).
    pub parent_rid: Option<String>,
    pub name: String,
    pub remote_revision: String,
    pub content_mime_types: HashSet<String>,
    pub cache_policy: CachePolicy,
    pub enabled: bool,
    pub attributes: AttributeMap,
}

pub struct SyncInput {
    pub resource_id: ResourceId,
    pub local_root: CollectionId,
    pub nodes: Vec<RemoteCollectionNode>,
    pub incremental: bool,
    /// Rids to remove (incremental mode only; spec §4.7 step 6).
    pub removed: Vec<String>,
    /// Attribute type names the resource must not overwrite locally.
    pub keep_local_changes: HashSet<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub no_op: bool,
}

/// Runs one Collection Sync pass to completion. Returns the events the
/// transaction committed, if any, so the caller can forward them to the
/// change stream (the pass itself has no subscriber list to push into).
pub async fn sync(session: &mut Session, input: SyncInput) -> Result<(SyncReport, Vec<ChangeEvent>)> {
    let local = load_local_tree(session, input.resource_id).await?;

    if !input.incremental && is_no_op(&local, &input.nodes) {
        return Ok((SyncReport { no_op: true, ..Default::default() }, Vec::new()));
    }

    let implicit = session.ensure_open().await?;
    let result = run_walk(session, &input, &local).await;
    session.finish_implicit(implicit, result).await
}

struct LocalNode {
    id: CollectionId,
    rid: String,
    name: String,
    remote_revision: String,
    content_mime_types: HashSet<String>,
    cache_policy: CachePolicy,
    enabled: bool,
    attributes: AttributeMap,
    parent_id: Option<CollectionId>,
}

async fn load_local_tree(session: &Session, resource_id: ResourceId) -> Result<HashMap<String, LocalNode>> {
    let conn = session.store().connection()?;
    let filter = pim_core::Filter::Eq("resource_id".into(), pim_api::Value::Integer(resource_id.get()));
    let collections = repo::find_collections(&conn, &filter).await?;
    Ok(collections
        .into_iter()
        .filter(|c| !c.remote_id.is_empty())
        .map(|c| {
            (
                c.remote_id.clone(),
                LocalNode {
                    id: c.id,
                    rid: c.remote_id,
                    name: c.name,
                    remote_revision: c.remote_revision,
                    content_mime_types: c.content_mime_types,
                    cache_policy: c.cache_policy,
                    enabled: c.enabled,
                    attributes: c.attributes,
                    parent_id: c.parent_id,
                },
            )
        })
        .collect())
}

/// Pre-check (spec §4.7 step 2): skip opening a transaction entirely when
/// the remote listing is already fully reflected locally.
fn is_no_op(local: &HashMap<String, LocalNode>, remote: &[RemoteCollectionNode]) -> bool {
    if local.len() != remote.len() {
        return false;
    }
    remote.iter().all(|r| match local.get(&r.rid) {
        None => false,
        Some(l) => {
            l.name == r.name
                && l.remote_revision == r.remote_revision
                && l.content_mime_types == r.content_mime_types
                && l.cache_policy == r.cache_policy
                && l.enabled == r.enabled
                && l.attributes == r.attributes
        }
    })
}

async fn run_walk(
    session: &mut Session,
    input: &SyncInput,
    local: &HashMap<String, LocalNode>,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut resolved: HashMap<String, CollectionId> = local.iter().map(|(rid, n)| (rid.clone(), n.id)).collect();
    let mut touched: HashSet<String> = HashSet::new();

    let mut pending: Vec<&RemoteCollectionNode> = input.nodes.iter().collect();

    // Topological walk: repeatedly sweep the pending list, processing any
    // node whose parent is already resolved (root, or seen this pass).
    // Terminates once a full sweep makes no progress — whatever remains is
    // orphaned.
    loop {
        let mut progressed = false;
        let mut next_pending = Vec::new();

        for node in pending {
            let parent_id = match &node.parent_rid {
                None => Some(input.local_root),
                Some(prid) => resolved.get(prid).copied(),
            };
            let Some(parent_id) = parent_id else {
                next_pending.push(node);
                continue;
            };

            apply_node(session, input, node, parent_id, local.get(&node.rid), &mut report).await?;
            let conn = session.conn()?;
            let id = repo::find_collection_by_name(conn, Some(parent_id), &node.name)
                .await?
                .map(|c| c.id)
                .ok_or(EngineError::StorageError("node vanished mid-walk".into()))?;
            resolved.insert(node.rid.clone(), id);
            touched.insert(node.rid.clone());
            progressed = true;

            // Forces an intermediate commit every BATCH_COMMIT_SIZE nodes
            // (spec §4.7 step 4); the Session transparently re-begins.
            session.note_child_operation().await?;
        }

        if !progressed {
            pending = next_pending;
            break;
        }
        pending = next_pending;
        if pending.is_empty() {
            break;
        }
    }

    if !pending.is_empty() {
        return Err(EngineError::OrphanCollections);
    }

    if input.incremental {
        for rid in &input.removed {
            if let Some(local_node) = local.get(rid) {
                delete_subtree(session, local_node.id).await?;
                report.deleted += 1;
            }
        }
    } else {
        // Non-incremental: anything local, untouched, with a non-empty
        // remote id, and no processed children, is gone from upstream.
        let has_child_touched: HashSet<CollectionId> = local
            .values()
            .filter(|n| touched.contains(&n.rid))
            .filter_map(|n| n.parent_id)
            .collect();
        for node in local.values() {
            if touched.contains(&node.rid) {
                continue;
            }
            if has_child_touched.contains(&node.id) {
                continue;
            }
            delete_subtree(session, node.id).await?;
            report.deleted += 1;
        }
    }

    Ok(report)
}

async fn apply_node(
    session: &mut Session,
    input: &SyncInput,
    node: &RemoteCollectionNode,
    parent_id: CollectionId,
    existing: Option<&LocalNode>,
    report: &mut SyncReport,
) -> Result<()> {
    match existing {
        Some(local) => {
            let mut attrs = node.attributes.clone();
            for kept in &input.keep_local_changes {
                if let Some(v) = local.attributes.get(kept) {
                    attrs.insert(kept.clone(), v.clone());
                } else {
                    attrs.remove(kept);
                }
            }

            if local.parent_id != Some(parent_id) {
                let conn = session.conn()?;
                repo::reparent_collection(conn, local.id, parent_id).await?;
            }
            if local.name != node.name {
                let conn = session.conn()?;
                repo::rename_collection(conn, local.id, &node.name).await?;
            }
            let conn = session.conn()?;
            repo::update_collection_fields(
                conn,
                local.id,
                None,
                Some(node.remote_revision.as_str()),
                Some(&node.content_mime_types),
                Some(&node.cache_policy),
                Some(node.enabled),
                None,
                None,
            )
            .await?;
            let conn = session.conn()?;
            let remove: Vec<String> = local.attributes.keys().filter(|k| !attrs.contains_key(*k)).cloned().collect();
            repo::merge_collection_attributes(conn, local.id, &attrs, &remove).await?;
            session.push_event(pim_api::wire::ChangeEvent::CollectionChanged {
                collection_id: local.id,
                changed_parts: Default::default(),
            })?;
            report.updated += 1;
        }
        None => {
            let conn = session.conn()?;
            let id = repo::create_collection(
                conn,
                repo::NewCollection {
                    parent_id: Some(parent_id),
                    name: &node.name,
                    resource_id: input.resource_id,
                    remote_id: &node.rid,
                    remote_revision: &node.remote_revision,
                    content_mime_types: &node.content_mime_types,
                    cache_policy: &node.cache_policy,
                    is_virtual: false,
                    attributes: &node.attributes,
                },
            )
            .await?;
            session.push_event(pim_api::wire::ChangeEvent::CollectionAdded { collection_id: id })?;
            report.created += 1;
        }
    }
    Ok(())
}

async fn delete_subtree(session: &mut Session, root: CollectionId) -> Result<()> {
    let mut stack = vec![root];
    let mut subtree = Vec::new();
    while let Some(id) = stack.pop() {
        let conn = session.conn()?;
        for child in repo::children_of(conn, Some(id)).await? {
            stack.push(child.id);
        }
        subtree.push(id);
    }
    subtree.reverse();

    for id in subtree {
        let conn = session.conn()?;
        for item in repo::items_in_collection(conn, id).await? {
            repo::delete_parts_for_item(conn, item.id).await?;
            repo::delete_item_row(conn, item.id).await?;
            session.push_event(pim_api::wire::ChangeEvent::ItemRemoved {
                item_id: item.id,
                collection_id: id,
            })?;
        }
        let conn = session.conn()?;
        repo::delete_collection_row(conn, id).await?;
        session.push_event(pim_api::wire::ChangeEvent::CollectionRemoved { collection_id: id })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use std::sync::Arc;

    async fn setup() -> (Arc<Store>, ResourceId, CollectionId) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        crate::storage::init(&store).await.unwrap();
        let conn = store.connection().unwrap();
        let resource_id = repo::create_resource(&conn, "res1", false).await.unwrap();
        let root = repo::create_collection(
            &conn,
            repo::NewCollection {
                parent_id: None,
                name: "res1",
                resource_id,
                remote_id: "",
                remote_revision: "",
                content_mime_types: &Default::default(),
                cache_policy: &CachePolicy::default(),
                is_virtual: false,
                attributes: &Default::default(),
            },
        )
        .await
        .unwrap();
        (store, resource_id, root)
    }

    #[tokio::test]
    async fn creates_new_remote_collection() {
        let (store, resource_id, root) = setup().await;
        let mut session = Session::new(store);
        let (report, _events) = sync(
            &mut session,
            SyncInput {
                resource_id,
                local_root: root,
                nodes: vec![RemoteCollectionNode {
                    rid: "r1".into(),
                    parent_rid: None,
                    name: "Inbox".into(),
                    remote_revision: "v1".into(),
                    content_mime_types: Default::default(),
                    cache_policy: CachePolicy::default(),
                    enabled: true,
                    attributes: Default::default(),
                }],
                incremental: false,
                removed: Vec::new(),
                keep_local_changes: Default::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(report, SyncReport { created: 1, updated: 0, deleted: 0, no_op: false });
    }

    #[tokio::test]
    async fn second_identical_run_is_no_op() {
        let (store, resource_id, root) = setup().await;
        let mut session = Session::new(store);
        let node = RemoteCollectionNode {
            rid: "r1".into(),
            parent_rid: None,
            name: "Inbox".into(),
            remote_revision: "v1".into(),
            content_mime_types: Default::default(),
            cache_policy: CachePolicy::default(),
            enabled: true,
            attributes: Default::default(),
        };
        sync(
            &mut session,
            SyncInput {
                resource_id,
                local_root: root,
                nodes: vec![node.clone()],
                incremental: false,
                removed: Vec::new(),
                keep_local_changes: Default::default(),
            },
        )
        .await
        .unwrap();

        let (report, _events) = sync(
            &mut session,
            SyncInput {
                resource_id,
                local_root: root,
                nodes: vec![node],
                incremental: false,
                removed: Vec::new(),
                keep_local_changes: Default::default(),
            },
        )
        .await
        .unwrap();
        assert!(report.no_op);
    }
}
