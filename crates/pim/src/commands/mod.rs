//! Command Handlers (spec §4.4): one module per entity family plus the
//! dispatcher that adapts the abstract [`Command`] stream to them.

pub mod collections;
pub mod items;
pub mod subscriptions;
pub mod tags;

use pim_api::wire::{Command, Response, ResponseBody};
use pim_api::{EngineError, ResourceId, Scope};

use crate::parts::PartStreamer;
use crate::storage::repo;
use crate::transaction::Session;

/// Executes one command to completion, producing exactly one response
/// (spec §4.4: "MUST produce exactly one success response or one failure
/// response"). `caller_resource` identifies the session's owning resource,
/// if any — plain client sessions pass `None`.
pub async fn dispatch(
    session: &mut Session,
    streamer: &PartStreamer,
    caller_resource: Option<ResourceId>,
    command: Command,
) -> Response {
    let result = run(session, streamer, caller_resource, command).await;
    match result {
        Ok(body) => Response::ok(body),
        Err(err) => err.into(),
    }
}

async fn run(
    session: &mut Session,
    streamer: &PartStreamer,
    caller_resource: Option<ResourceId>,
    command: Command,
) -> crate::errors::Result<ResponseBody> {
    match command {
        Command::BeginTx => {
            session.begin().await?;
            Ok(ResponseBody::Empty)
        }
        Command::CommitTx => {
            session.commit().await?;
            Ok(ResponseBody::Empty)
        }
        Command::RollbackTx => {
            session.rollback().await?;
            Ok(ResponseBody::Empty)
        }
        Command::CreateCollection(input) => {
            Ok(ResponseBody::CollectionId(collections::create(session, input).await?))
        }
        Command::ModifyCollection(input) => {
            collections::modify(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::MoveCollection(input) => {
            collections::move_collection(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::DeleteCollection(input) => {
            collections::delete(session, streamer, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::FetchCollections(input) => {
            let conn = session.conn()?;
            let filter = crate::scope_resolver::resolve_scope(conn, &input.scope, &input.context).await?;
            let conn = session.conn()?;
            let found = crate::storage::repo::find_collections(conn, &filter).await?;
            let session_id = session.id().to_string();
            let mut ids = Vec::with_capacity(found.len());
            for collection in found {
                let conn = session.conn()?;
                // Unsubscribed collections are filtered from fetch results for
                // this session; absence of a row means the default, enabled.
                if repo::get_subscription(conn, &session_id, collection.id).await? != Some(false) {
                    ids.push(collection.id);
                }
            }
            Ok(ResponseBody::CollectionIds(ids))
        }
        Command::CreateItem(input) => {
            let summary = items::append(session, streamer, input).await?;
            Ok(ResponseBody::Item(summary))
        }
        Command::ModifyItem(input) => {
            let summaries = items::modify(session, caller_resource, input).await?;
            Ok(ResponseBody::Items(summaries))
        }
        Command::MoveItems(input) => {
            items::move_items(session, caller_resource, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::CopyItems(input) => {
            let ids = items::copy_items(session, streamer, input).await?;
            Ok(ResponseBody::Ids(ids.into_iter().map(|i| i.get()).collect()))
        }
        Command::DeleteItems(input) => {
            let count = items::delete_items(session, streamer, input).await?;
            Ok(ResponseBody::Ids(vec![count as i64]))
        }
        Command::FetchItems(input) => {
            let conn = session.conn()?;
            let filter = crate::scope_resolver::resolve_scope(conn, &input.scope, &input.context).await?;
            let conn = session.conn()?;
            let found = crate::storage::repo::find_items(conn, &filter).await?;
            Ok(ResponseBody::Ids(found.into_iter().map(|i| i.id.get()).collect()))
        }
        Command::LinkItems(input) => {
            items::link_items(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::UnlinkItems(input) => {
            items::unlink_items(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::CreateTag(input) => Ok(ResponseBody::TagId(tags::create(session, input).await?)),
        Command::DeleteTag(input) => {
            tags::delete(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::ModifyTag(input) => {
            tags::modify(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::FetchTags(input) => {
            let conn = session.conn()?;
            let filter = pim_core::scope_to_query(&input.scope, &pim_api::ScopeContext::default())?;
            let conn = session.conn()?;
            let found = repo::find_tags(conn, &filter).await?;
            Ok(ResponseBody::Ids(found.into_iter().map(|t| t.id.get()).collect()))
        }
        Command::SearchResult(input) => {
            let kind = match &input.scope {
                Scope::Uid(_) | Scope::Rid(_) => None,
                Scope::Hrid(_) => Some("Hrid"),
                Scope::Gid(_) => Some("Gid"),
            };
            if let Some(kind) = kind {
                return Err(EngineError::UnsupportedScope {
                    kind: kind.to_string(),
                    reason: "SearchResult only accepts Uid or Rid scopes".into(),
                });
            }
            let conn = session.conn()?;
            let filter = crate::scope_resolver::resolve_scope(conn, &input.scope, &input.context).await?;
            let conn = session.conn()?;
            let found = repo::find_items(conn, &filter).await?;
            Ok(ResponseBody::Ids(found.into_iter().map(|i| i.id.get()).collect()))
        }
        Command::Subscribe(input) => {
            subscriptions::subscribe(session, input).await?;
            Ok(ResponseBody::Empty)
        }
        Command::Unsubscribe(input) => {
            subscriptions::unsubscribe(session, input).await?;
            Ok(ResponseBody::Empty)
        }
    }
}
