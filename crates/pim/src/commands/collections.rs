//! Collection command handlers (spec §4.4): Create, Modify, Move, Delete.

use std::collections::HashSet;

use pim_api::wire::{ChangedPart, ChangeEvent, CreateCollection, DeleteCollection, ModifyCollection, MoveCollection};
use pim_api::{CollectionId, EngineError};
use pim_core::{CachePolicy, ListPreferences, TriState};

use crate::errors::Result;
use crate::parts::PartStreamer;
use crate::storage::repo;
use crate::transaction::Session;

fn convert_tristate(t: &pim_api::wire::TriState) -> TriState {
    match t {
        pim_api::wire::TriState::Default => TriState::Default,
        pim_api::wire::TriState::Enabled => TriState::Enabled,
        pim_api::wire::TriState::Disabled => TriState::Disabled,
    }
}

fn convert_cache_policy(input: &pim_api::wire::CachePolicyInput) -> CachePolicy {
    CachePolicy {
        inherit_from_parent: input.inherit_from_parent,
        check_interval_minutes: input.check_interval_minutes,
        cache_timeout_minutes: input.cache_timeout_minutes,
        local_parts: input.local_parts.clone(),
        sync_on_demand: input.sync_on_demand,
    }
}

pub async fn create(session: &mut Session, input: CreateCollection) -> Result<CollectionId> {
    let implicit = session.ensure_open().await?;
    let result = create_inner(session, input).await;
    let (id, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(id)
}

async fn create_inner(session: &mut Session, input: CreateCollection) -> Result<CollectionId> {
    let conn = session.conn()?;
    let parent = repo::get_collection(conn, input.parent_id).await?;

    let (resource_id, mut mime_types, cache_policy, parent_is_search) = match &parent {
        Some(p) => (
            p.resource_id,
            if input.content_mime_types.is_empty() {
                p.content_mime_types.clone()
            } else {
                input.content_mime_types.clone()
            },
            p.cache_policy.clone(),
            p.is_search_collection(),
        ),
        None => (
            input.resource_id,
            input.content_mime_types.clone(),
            CachePolicy::default(),
            false,
        ),
    };
    if parent_is_search && !input.is_virtual {
        return Err(EngineError::IllegalMove {
            reason: "search collections may only have virtual children".into(),
        });
    }
    if !input.content_mime_types.is_empty() {
        mime_types = input.content_mime_types;
    }
    let cache_policy = input
        .cache_policy
        .as_ref()
        .map(convert_cache_policy)
        .unwrap_or(cache_policy);

    let conn = session.conn()?;
    let id = repo::create_collection(
        conn,
        repo::NewCollection {
            parent_id: Some(input.parent_id),
            name: &input.name,
            resource_id,
            remote_id: input.remote_id.as_deref().unwrap_or(""),
            remote_revision: "",
            content_mime_types: &mime_types,
            cache_policy: &cache_policy,
            is_virtual: input.is_virtual,
            attributes: &input.attributes,
        },
    )
    .await?;

    session.push_event(ChangeEvent::CollectionAdded { collection_id: id })?;
    Ok(id)
}

pub async fn modify(session: &mut Session, input: ModifyCollection) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = modify_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn modify_inner(session: &mut Session, input: ModifyCollection) -> Result<()> {
    let conn = session.conn()?;
    let existing = repo::get_collection(conn, input.collection_id)
        .await?
        .ok_or(EngineError::NotFound)?;

    let mut changed: HashSet<ChangedPart> = HashSet::new();

    if let Some(new_parent) = input.parent_id {
        if new_parent == input.collection_id {
            return Err(EngineError::IllegalMove {
                reason: "collection cannot become its own parent".into(),
            });
        }
        if is_descendant(conn, new_parent, input.collection_id).await? {
            return Err(EngineError::IllegalMove {
                reason: "cannot move a collection under its own descendant".into(),
            });
        }
        let target_name = input.name.clone().unwrap_or_else(|| existing.name.clone());
        if repo::find_collection_by_name(conn, Some(new_parent), &target_name)
            .await?
            .is_some()
        {
            return Err(EngineError::NameConflict { name: target_name });
        }
        let conn = session.conn()?;
        let source_parent = existing.parent_id;
        repo::reparent_collection(conn, input.collection_id, new_parent).await?;
        session.push_event(ChangeEvent::CollectionMoved {
            collection_id: input.collection_id,
            source_parent: source_parent.unwrap_or(new_parent),
            dest_parent: new_parent,
        })?;
        changed.insert(ChangedPart::ParentId);
    }

    if let Some(name) = &input.name {
        if name != &existing.name {
            let conn = session.conn()?;
            repo::rename_collection(conn, input.collection_id, name).await?;
            changed.insert(ChangedPart::Name);
        }
    }

    if input.remote_id.is_some() {
        changed.insert(ChangedPart::RemoteId);
    }
    if input.remote_revision.is_some() {
        changed.insert(ChangedPart::RemoteRevision);
    }
    if input.cache_policy.is_some() {
        changed.insert(ChangedPart::CachePolicy);
    }
    if input.content_mime_types.is_some() {
        changed.insert(ChangedPart::ContentMimeTypes);
    }
    if input.enabled.is_some() {
        changed.insert(ChangedPart::Enabled);
    }
    if input.list_preferences.is_some() {
        changed.insert(ChangedPart::ListPreferences);
    }
    if input.query_string.is_some() {
        changed.insert(ChangedPart::QueryString);
    }
    for key in &input.attributes_remove {
        changed.insert(ChangedPart::Attribute(key.clone()));
    }
    for key in input.attributes_add.keys() {
        changed.insert(ChangedPart::Attribute(key.clone()));
    }

    let conn = session.conn()?;
    repo::update_collection_fields(
        conn,
        input.collection_id,
        input.remote_id.as_deref(),
        input.remote_revision.as_deref(),
        input.content_mime_types.as_ref(),
        input.cache_policy.as_ref().map(convert_cache_policy).as_ref(),
        input.enabled,
        input
            .list_preferences
            .as_ref()
            .map(|p| ListPreferences {
                display: convert_tristate(&p.display),
                sync: convert_tristate(&p.sync),
                index: convert_tristate(&p.index),
            })
            .as_ref(),
        input.query_string.as_deref().map(Some),
    )
    .await?;

    if !input.attributes_add.is_empty() || !input.attributes_remove.is_empty() {
        let conn = session.conn()?;
        repo::merge_collection_attributes(conn, input.collection_id, &input.attributes_add, &input.attributes_remove)
            .await?;
    }

    if !changed.is_empty() {
        session.push_event(ChangeEvent::CollectionChanged {
            collection_id: input.collection_id,
            changed_parts: changed,
        })?;
    }
    Ok(())
}

async fn is_descendant(
    conn: &turso::Connection,
    candidate: CollectionId,
    ancestor: CollectionId,
) -> Result<bool> {
    let mut current = Some(candidate);
    while let Some(id) = current {
        if id == ancestor {
            return Ok(true);
        }
        current = repo::get_collection(conn, id).await?.and_then(|c| c.parent_id);
    }
    Ok(false)
}

/// Recursive subtree move (spec §4.4, scenario 3): unlike a plain
/// `Modify(parent_id)`, a collection move never also reports a generic
/// `CollectionChanged` — the destination resource cascades to every
/// descendant and exactly one `CollectionMoved` is observed at the
/// source parent.
///
/// Payload pre-fetch for not-yet-cached items ahead of the move (spec
/// §4.4: "retrieve all not-yet-cached items of the subtree, cache cleaner
/// inhibited for the duration") is the caller's job: it requires a
/// [`crate::retriever::RetrievalProvider`] for the owning resource, which
/// this command layer has no registry of. A caller that embeds resource
/// connectors calls `Retriever::ensure_cached` for every item under
/// `collection_id` before issuing this command.
pub async fn move_collection(session: &mut Session, input: MoveCollection) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = move_collection_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn move_collection_inner(session: &mut Session, input: MoveCollection) -> Result<()> {
    let conn = session.conn()?;
    let existing = repo::get_collection(conn, input.collection_id)
        .await?
        .ok_or(EngineError::NotFound)?;

    if input.destination_parent == input.collection_id {
        return Err(EngineError::IllegalMove {
            reason: "collection cannot become its own parent".into(),
        });
    }
    if is_descendant(conn, input.destination_parent, input.collection_id).await? {
        return Err(EngineError::IllegalMove {
            reason: "cannot move a collection under its own descendant".into(),
        });
    }
    let destination = repo::get_collection(conn, input.destination_parent)
        .await?
        .ok_or(EngineError::NotFound)?;
    if repo::find_collection_by_name(conn, Some(input.destination_parent), &existing.name)
        .await?
        .is_some()
    {
        return Err(EngineError::NameConflict { name: existing.name.clone() });
    }

    let source_parent = existing.parent_id.unwrap_or(input.destination_parent);
    let conn = session.conn()?;
    repo::reparent_collection(conn, input.collection_id, input.destination_parent).await?;

    if existing.resource_id != destination.resource_id {
        cascade_resource(session, input.collection_id, destination.resource_id).await?;
    }

    session.push_event(ChangeEvent::CollectionMoved {
        collection_id: input.collection_id,
        source_parent,
        dest_parent: input.destination_parent,
    })?;
    Ok(())
}

/// Depth-first walk assigning `resource_id` to `root` and every
/// descendant, mirroring `CollectionSync::delete_subtree`'s iterative
/// stack so the move never needs a recursive `async fn`.
async fn cascade_resource(
    session: &mut Session,
    root: CollectionId,
    resource_id: pim_api::ResourceId,
) -> Result<()> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let conn = session.conn()?;
        repo::set_collection_resource(conn, id, resource_id).await?;
        let conn = session.conn()?;
        for child in repo::children_of(conn, Some(id)).await? {
            stack.push(child.id);
        }
    }
    Ok(())
}

pub async fn delete(session: &mut Session, streamer: &PartStreamer, input: DeleteCollection) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = delete_inner(session, streamer, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn delete_inner(session: &mut Session, streamer: &PartStreamer, input: DeleteCollection) -> Result<()> {
    let conn = session.conn()?;
    let target = repo::get_collection(conn, input.collection_id)
        .await?
        .ok_or(EngineError::NotFound)?;
    if target.parent_id.is_none() {
        return Err(EngineError::IllegalMove {
            reason: "root collections cannot be deleted directly".into(),
        });
    }
    // The distinguished virtual root (the "Search" tree) is the one virtual
    // collection living directly under the absolute root; it may not be
    // deleted either (spec: "Deletion of the distinguished virtual root and
    // of the absolute root is rejected").
    if target.is_virtual {
        if let Some(parent_id) = target.parent_id {
            let parent = repo::get_collection(conn, parent_id).await?.ok_or(EngineError::NotFound)?;
            if parent.parent_id.is_none() {
                return Err(EngineError::IllegalMove {
                    reason: "the distinguished virtual root cannot be deleted".into(),
                });
            }
        }
    }

    let mut stack = vec![input.collection_id];
    let mut subtree = Vec::new();
    while let Some(id) = stack.pop() {
        let conn = session.conn()?;
        for child in repo::children_of(conn, Some(id)).await? {
            stack.push(child.id);
        }
        subtree.push(id);
    }
    // Depth-first, leaves first: reverse the pre-order collection walk.
    subtree.reverse();

    for id in subtree {
        let conn = session.conn()?;
        for item in repo::items_in_collection(conn, id).await? {
            let removed_parts = repo::delete_parts_for_item(conn, item.id).await?;
            repo::delete_item_row(conn, item.id).await?;
            let tx = session.transaction_mut().ok_or(EngineError::NoTransaction)?;
            streamer.delete_parts(tx, &removed_parts);
            session.push_event(ChangeEvent::ItemRemoved {
                item_id: item.id,
                collection_id: id,
            })?;
        }
        let conn = session.conn()?;
        repo::delete_collection_row(conn, id).await?;
        session.push_event(ChangeEvent::CollectionRemoved { collection_id: id })?;
    }
    Ok(())
}
