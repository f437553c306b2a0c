//! Item command handlers (spec §4.4): Append, Modify, Move, Copy,
//! Link/Unlink, Delete, Fetch.

use std::collections::HashSet;

use chrono::{SubsecRound, Utc};
use pim_api::wire::{AppendItem, ChangeEvent, CopyItems, DeleteItems, ItemSummary, LinkItems,
    ModifyItem, MoveItems, PartInput, SetOp, UnlinkItems};
use pim_api::{EngineError, ItemId, ResourceId};
use pim_core::entities::TRIVIAL_MODIFY_FIELDS;
use pim_core::Item;

use crate::errors::Result;
use crate::parts::PartStreamer;
use crate::scope_resolver::resolve_scope;
use crate::storage::repo;
use crate::transaction::Session;

fn now() -> String {
    // Truncated to whole seconds so a subsequent fetch compares equal
    // (spec §4.4: "if the underlying database lacks sub-second precision").
    Utc::now().trunc_subsecs(0).to_rfc3339()
}

pub async fn append(
    session: &mut Session,
    streamer: &PartStreamer,
    input: AppendItem,
) -> Result<ItemSummary> {
    let implicit = session.ensure_open().await?;
    let result = append_inner(session, streamer, input).await;
    let (summary, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(summary)
}

async fn append_inner(
    session: &mut Session,
    streamer: &PartStreamer,
    input: AppendItem,
) -> Result<ItemSummary> {
    let conn = session.conn()?;
    let destination = repo::get_collection(conn, input.destination)
        .await?
        .ok_or(EngineError::NotFound)?;
    if destination.is_virtual {
        return Err(EngineError::IllegalMove {
            reason: "cannot append into a virtual collection".into(),
        });
    }

    let gid = match input.gid.filter(|g| !g.is_empty()) {
        Some(g) => g,
        None => input.remote_id.clone().unwrap_or_default(),
    };
    let remote_id = input.remote_id.clone().unwrap_or_default();

    let merge_target = if input.merge.contains(&pim_api::wire::MergeOption::Gid) && !gid.is_empty() {
        repo::find_items_by_gid(conn, input.destination, &gid)
            .await?
            .into_iter()
            .next()
    } else if input.merge.contains(&pim_api::wire::MergeOption::Rid) && !remote_id.is_empty() {
        repo::find_item_by_remote_id(conn, input.destination, &remote_id).await?
    } else {
        None
    };

    let part_size_sum: i64 = input.parts.iter().map(|p| p.data.len() as i64).sum();
    let size = input.size_hint.max(part_size_sum);

    if let Some(existing) = merge_target {
        let modified = now();
        repo::patch_item(
            conn,
            existing.id,
            repo::ItemPatch {
                remote_id: Some(&remote_id),
                remote_revision: None,
                gid: Some(&gid),
                size: Some(size),
                flags: Some(&input.flags),
                clear_dirty: false,
                bump_revision: true,
                modified: &modified,
            },
        )
        .await?;
        store_parts(session, streamer, existing.id, existing.revision + 1, &input.parts).await?;
        let event = ChangeEvent::ItemChanged {
            item_id: existing.id,
            collection_id: input.destination,
            changed_parts: HashSet::new(),
        };
        session.push_event(event)?;
        return Ok(ItemSummary {
            id: existing.id,
            revision: existing.revision + 1,
        });
    }

    let conn = session.conn()?;
    let item_id = repo::insert_item(
        conn,
        repo::NewItem {
            collection_id: input.destination,
            mime_type: &input.mime_type,
            remote_id: &remote_id,
            remote_revision: "",
            gid: &gid,
            size,
            flags: &input.flags,
            attributes: &input.attributes,
        },
    )
    .await?;
    store_parts(session, streamer, item_id, 0, &input.parts).await?;
    for tag_id in &input.tags {
        let conn = session.conn()?;
        repo::add_item_tag(conn, item_id, *tag_id).await?;
    }
    session.push_event(ChangeEvent::ItemAdded {
        item_id,
        collection_id: input.destination,
    })?;
    Ok(ItemSummary { id: item_id, revision: 0 })
}

async fn store_parts(
    session: &mut Session,
    streamer: &PartStreamer,
    item_id: ItemId,
    revision: i64,
    parts: &[PartInput],
) -> Result<()> {
    for part in parts {
        let tx = session
            .transaction_mut()
            .ok_or(EngineError::NoTransaction)?;
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

pub async fn modify(
    session: &mut Session,
    caller_resource: Option<ResourceId>,
    input: ModifyItem,
) -> Result<Vec<ItemSummary>> {
    let implicit = session.ensure_open().await?;
    let result = modify_inner(session, caller_resource, input).await;
    let (summaries, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(summaries)
}

async fn modify_inner(
    session: &mut Session,
    caller_resource: Option<ResourceId>,
    input: ModifyItem,
) -> Result<Vec<ItemSummary>> {
    let conn = session.conn()?;
    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    if items.is_empty() {
        return Err(EngineError::NotFound);
    }

    let owner_only_touch = input.remote_id.is_some()
        || input.remote_revision.is_some()
        || input.clear_dirty;

    let mut touched_fields: Vec<&str> = Vec::new();
    if input.remote_id.is_some() {
        touched_fields.push("remote_id");
    }
    if input.remote_revision.is_some() {
        touched_fields.push("remote_revision");
    }
    if input.gid.is_some() {
        touched_fields.push("gid");
    }
    let trivial_only = !touched_fields.is_empty()
        && touched_fields.iter().all(|f| TRIVIAL_MODIFY_FIELDS.contains(f))
        && input.flags.is_none()
        && input.attributes_add.is_empty()
        && input.attributes_remove.is_empty()
        && input.parts_add.is_empty()
        && input.parts_remove.is_empty();

    let modified = now();
    let mut summaries = Vec::with_capacity(items.len());

    for item in &items {
        if let Some(old_revision) = input.old_revision {
            if old_revision != item.revision {
                return Err(EngineError::RevisionConflict);
            }
        }
        if item.dirty && caller_resource.is_some() {
            return Err(EngineError::DirtyPayloadConflict);
        }
        if owner_only_touch && caller_resource.is_none() {
            return Err(EngineError::NotOwnerResource);
        }

        let flags = match &input.flags {
            Some(SetOp::Set(vals)) => Some(vals.iter().cloned().collect::<HashSet<_>>()),
            Some(SetOp::Add(vals)) => {
                let mut set = item.flags.clone();
                set.extend(vals.iter().cloned());
                Some(set)
            }
            Some(SetOp::Remove(vals)) => {
                let mut set = item.flags.clone();
                for v in vals {
                    set.remove(v);
                }
                Some(set)
            }
            None => None,
        };

        let conn = session.conn()?;
        repo::patch_item(
            conn,
            item.id,
            repo::ItemPatch {
                remote_id: input.remote_id.as_deref(),
                remote_revision: input.remote_revision.as_deref(),
                gid: input.gid.as_deref(),
                size: input.size,
                flags: flags.as_ref(),
                clear_dirty: input.clear_dirty,
                bump_revision: !trivial_only,
                modified: &modified,
            },
        )
        .await?;

        if !input.attributes_add.is_empty() || !input.attributes_remove.is_empty() {
            merge_item_attributes(conn, item, &input.attributes_add, &input.attributes_remove).await?;
        }

        match &input.tags {
            Some(SetOp::Set(tags)) => {
                for existing_tag in repo::item_tag_ids(conn, item.id).await? {
                    repo::remove_item_tag(conn, item.id, existing_tag).await?;
                }
                for tag in tags {
                    repo::add_item_tag(conn, item.id, *tag).await?;
                }
            }
            Some(SetOp::Add(tags)) => {
                for tag in tags {
                    repo::add_item_tag(conn, item.id, *tag).await?;
                }
            }
            Some(SetOp::Remove(tags)) => {
                for tag in tags {
                    repo::remove_item_tag(conn, item.id, *tag).await?;
                }
            }
            None => {}
        }

        let new_revision = if trivial_only { item.revision } else { item.revision + 1 };
        let changed_parts = if trivial_only {
            HashSet::new()
        } else if input.flags.is_some()
            && input.attributes_add.is_empty()
            && input.parts_add.is_empty()
            && input.parts_remove.is_empty()
        {
            let mut s = HashSet::new();
            s.insert("FLAGS".to_string());
            s
        } else {
            let mut s = HashSet::new();
            for p in &input.parts_add {
                s.insert(p.name.clone());
            }
            for p in &input.parts_remove {
                s.insert(p.clone());
            }
            s
        };

        let gid_only = touched_fields == ["gid"];
        if !gid_only {
            session.push_event(ChangeEvent::ItemChanged {
                item_id: item.id,
                collection_id: item.collection_id,
                changed_parts,
            })?;
        }

        summaries.push(ItemSummary {
            id: item.id,
            revision: new_revision,
        });
    }

    Ok(summaries)
}

async fn merge_item_attributes(
    conn: &turso::Connection,
    item: &Item,
    add: &pim_api::AttributeMap,
    remove: &[String],
) -> Result<()> {
    let mut attrs = item.attributes.clone();
    for key in remove {
        attrs.remove(key);
    }
    for (k, v) in add {
        attrs.insert(k.clone(), v.clone());
    }
    conn.execute(
        "UPDATE items SET attributes = ? WHERE id = ?",
        turso::params![
            crate::storage::codec::encode_attributes(&attrs),
            item.id.get()
        ],
    )
    .await?;
    Ok(())
}

pub async fn move_items(
    session: &mut Session,
    caller_resource: Option<ResourceId>,
    input: MoveItems,
) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = move_items_inner(session, caller_resource, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn move_items_inner(
    session: &mut Session,
    caller_resource: Option<ResourceId>,
    input: MoveItems,
) -> Result<()> {
    let conn = session.conn()?;
    let destination = repo::get_collection(conn, input.destination)
        .await?
        .ok_or(EngineError::NotFound)?;
    if destination.is_virtual {
        return Err(EngineError::IllegalMove {
            reason: "destination is a virtual collection".into(),
        });
    }

    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    if items.is_empty() {
        return Err(EngineError::NotFound);
    }

    let mut by_source: std::collections::HashMap<pim_api::CollectionId, Vec<ItemId>> =
        std::collections::HashMap::new();
    for item in &items {
        if item.collection_id == input.destination {
            return Err(EngineError::IllegalMove {
                reason: "source and destination are the same collection".into(),
            });
        }
        by_source.entry(item.collection_id).or_default().push(item.id);
    }

    let owner_mismatch = caller_resource.map(|r| r != destination.resource_id).unwrap_or(true);

    for item in &items {
        let conn = session.conn()?;
        repo::set_item_collection(conn, item.id, input.destination).await?;
        if owner_mismatch {
            repo::set_item_dirty(conn, item.id, true).await?;
        }
    }

    for (source, ids) in by_source {
        session.push_event(ChangeEvent::ItemsMoved {
            item_ids: ids.clone(),
            source_collection: source,
            dest_collection: input.destination,
        })?;
    }

    // remote_id is cleared only after the move notification carries the
    // original id (spec §4.4, SPEC_FULL §10 "remote_id clearing").
    for item in &items {
        let conn = session.conn()?;
        repo::clear_item_remote_id(conn, item.id).await?;
    }

    Ok(())
}

pub async fn copy_items(session: &mut Session, streamer: &PartStreamer, input: CopyItems) -> Result<Vec<ItemId>> {
    let implicit = session.ensure_open().await?;
    let result = copy_items_inner(session, streamer, input).await;
    let (ids, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(ids)
}

async fn copy_items_inner(
    session: &mut Session,
    streamer: &PartStreamer,
    input: CopyItems,
) -> Result<Vec<ItemId>> {
    let conn = session.conn()?;
    let destination = repo::get_collection(conn, input.destination)
        .await?
        .ok_or(EngineError::NotFound)?;
    if destination.is_virtual {
        return Err(EngineError::IllegalMove {
            reason: "cannot copy into a virtual collection".into(),
        });
    }
    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    if items.is_empty() {
        return Err(EngineError::NotFound);
    }

    let mut new_ids = Vec::with_capacity(items.len());
    for item in &items {
        let conn = session.conn()?;
        let source_parts = repo::parts_for_item(conn, item.id).await?;
        let new_id = repo::insert_item(
            conn,
            repo::NewItem {
                collection_id: input.destination,
                mime_type: &item.mime_type,
                remote_id: "",
                remote_revision: "",
                gid: &item.gid,
                size: item.size,
                flags: &item.flags,
                attributes: &item.attributes,
            },
        )
        .await?;
        for part in source_parts {
            if let Some(data) = part.data {
                let stored = {
                    let tx = session.transaction_mut().ok_or(EngineError::NoTransaction)?;
                    streamer.store(tx, new_id, 0, &part.name, &data).await?
                };
                let conn = session.conn()?;
                repo::upsert_part(
                    conn,
                    new_id,
                    &part.name,
                    stored.data.as_deref(),
                    stored.storage,
                    stored.external_ref.as_deref(),
                    part.size,
                )
                .await?;
            }
        }
        session.push_event(ChangeEvent::ItemAdded {
            item_id: new_id,
            collection_id: input.destination,
        })?;
        new_ids.push(new_id);
    }
    Ok(new_ids)
}

pub async fn link_items(session: &mut Session, input: LinkItems) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = link_items_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn link_items_inner(session: &mut Session, input: LinkItems) -> Result<()> {
    let conn = session.conn()?;
    let destination = repo::get_collection(conn, input.destination)
        .await?
        .ok_or(EngineError::NotFound)?;
    if !destination.is_virtual {
        return Err(EngineError::IllegalMove {
            reason: "link destination must be a virtual collection".into(),
        });
    }
    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    let mut linked = Vec::new();
    for item in &items {
        let conn = session.conn()?;
        if repo::link_item(conn, input.destination, item.id).await? {
            linked.push(item.id);
        }
    }
    if !linked.is_empty() {
        session.push_event(ChangeEvent::ItemsLinked {
            item_ids: linked,
            destination: input.destination,
        })?;
    }
    Ok(())
}

pub async fn unlink_items(session: &mut Session, input: UnlinkItems) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = unlink_items_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn unlink_items_inner(session: &mut Session, input: UnlinkItems) -> Result<()> {
    let conn = session.conn()?;
    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    let mut unlinked = Vec::new();
    for item in &items {
        let conn = session.conn()?;
        if repo::unlink_item(conn, input.destination, item.id).await? {
            unlinked.push(item.id);
        }
    }
    if !unlinked.is_empty() {
        session.push_event(ChangeEvent::ItemsUnlinked {
            item_ids: unlinked,
            destination: input.destination,
        })?;
    }
    Ok(())
}

pub async fn delete_items(session: &mut Session, streamer: &PartStreamer, input: DeleteItems) -> Result<usize> {
    let implicit = session.ensure_open().await?;
    let result = delete_items_inner(session, streamer, input).await;
    let (count, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(count)
}

async fn delete_items_inner(session: &mut Session, streamer: &PartStreamer, input: DeleteItems) -> Result<usize> {
    let conn = session.conn()?;
    let filter = resolve_scope(conn, &input.scope, &input.context).await?;
    let items = repo::find_items(conn, &filter).await?;
    if items.is_empty() {
        return Err(EngineError::NotFound);
    }
    let count = items.len();
    for item in &items {
        let conn = session.conn()?;
        let removed_parts = repo::delete_parts_for_item(conn, item.id).await?;
        repo::delete_item_row(conn, item.id).await?;
        let tx = session.transaction_mut().ok_or(EngineError::NoTransaction)?;
        streamer.delete_parts(tx, &removed_parts);
        session.push_event(ChangeEvent::ItemRemoved {
            item_id: item.id,
            collection_id: item.collection_id,
        })?;
    }
    Ok(count)
}
