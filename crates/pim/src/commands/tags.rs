//! Tag command handlers (spec §4.4): Create, Delete.

use pim_api::wire::{ChangeEvent, CreateTag, DeleteTag, ModifyTag};
use pim_api::{EngineError, TagId};

use crate::errors::Result;
use crate::storage::repo;
use crate::transaction::Session;

pub async fn create(session: &mut Session, input: CreateTag) -> Result<TagId> {
    let implicit = session.ensure_open().await?;
    let result = create_inner(session, input).await;
    let (id, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(id)
}

async fn create_inner(session: &mut Session, input: CreateTag) -> Result<TagId> {
    let conn = session.conn()?;
    if let Some(existing) = repo::get_tag_by_gid(conn, &input.gid).await? {
        if !input.merge {
            return Err(EngineError::NameConflict {
                name: input.gid.clone(),
            });
        }
        if let (Some(resource_id), Some(remote_id)) = (input.resource_id, &input.remote_id) {
            let conn = session.conn()?;
            repo::upsert_tag_remote_id(conn, existing.id, resource_id, remote_id).await?;
        }
        return Ok(existing.id);
    }

    let conn = session.conn()?;
    let id = repo::create_tag(conn, &input.gid, &input.tag_type, input.parent_id, &input.attributes).await?;
    if let (Some(resource_id), Some(remote_id)) = (input.resource_id, &input.remote_id) {
        let conn = session.conn()?;
        repo::upsert_tag_remote_id(conn, id, resource_id, remote_id).await?;
    }
    session.push_event(ChangeEvent::TagAdded { tag_id: id })?;
    Ok(id)
}

pub async fn delete(session: &mut Session, input: DeleteTag) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = delete_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

pub async fn modify(session: &mut Session, input: ModifyTag) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = modify_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn modify_inner(session: &mut Session, input: ModifyTag) -> Result<()> {
    let conn = session.conn()?;
    repo::get_tag(conn, input.tag_id).await?.ok_or(EngineError::NotFound)?;
    if !input.attributes_add.is_empty() || !input.attributes_remove.is_empty() {
        let conn = session.conn()?;
        repo::merge_tag_attributes(conn, input.tag_id, &input.attributes_add, &input.attributes_remove).await?;
    }
    if let Some(parent) = input.parent_id {
        let conn = session.conn()?;
        repo::set_tag_parent(conn, input.tag_id, parent).await?;
    }
    session.push_event(ChangeEvent::TagChanged { tag_id: input.tag_id })?;
    Ok(())
}

async fn delete_inner(session: &mut Session, input: DeleteTag) -> Result<()> {
    let conn = session.conn()?;
    let tagged_items = repo::items_tagged_with(conn, input.tag_id).await?;

    if !tagged_items.is_empty() {
        let mut removed = std::collections::HashSet::new();
        removed.insert(input.tag_id);
        session.push_event(ChangeEvent::ItemsTagsChanged {
            item_ids: tagged_items,
            added: std::collections::HashSet::new(),
            removed,
        })?;
    }

    let conn = session.conn()?;
    repo::delete_tag_row(conn, input.tag_id).await?;
    session.push_event(ChangeEvent::TagRemoved { tag_id: input.tag_id })?;
    Ok(())
}
