//! Collection subscription handlers (spec §4.3's Subscription state
//! supplement): per-session opt-out from a collection's change events,
//! persisted in `collection_subscriptions` and defaulting to `enabled`.

use pim_api::wire::{ChangeEvent, Subscribe, Unsubscribe};

use crate::errors::Result;
use crate::storage::repo;
use crate::transaction::Session;

pub async fn subscribe(session: &mut Session, input: Subscribe) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = subscribe_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn subscribe_inner(session: &mut Session, input: Subscribe) -> Result<()> {
    let session_id = session.id().to_string();
    let conn = session.conn()?;
    repo::set_subscription(conn, &session_id, input.collection_id, true).await?;
    session.push_event(ChangeEvent::CollectionSubscribed {
        collection_id: input.collection_id,
    })?;
    Ok(())
}

pub async fn unsubscribe(session: &mut Session, input: Unsubscribe) -> Result<()> {
    let implicit = session.ensure_open().await?;
    let result = unsubscribe_inner(session, input).await;
    let (v, events) = session.finish_implicit(implicit, result).await?;
    for event in events {
        session.push_event(event).ok();
    }
    Ok(v)
}

async fn unsubscribe_inner(session: &mut Session, input: Unsubscribe) -> Result<()> {
    let session_id = session.id().to_string();
    let conn = session.conn()?;
    repo::set_subscription(conn, &session_id, input.collection_id, false).await?;
    session.push_event(ChangeEvent::CollectionUnsubscribed {
        collection_id: input.collection_id,
    })?;
    Ok(())
}
