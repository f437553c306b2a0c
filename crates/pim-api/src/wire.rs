//! Abstract command stream, response stream and change stream (spec §6).
//!
//! These types describe the *contents* of the protocol, not its framing: no
//! transport, no byte layout. A concrete wire collaborator tags a `Command`
//! with a correlation id and serializes it; that framing is out of scope
//! here, same as in `holon_api::streaming` the `Change<T>` stream is
//! transport-agnostic and adapted by whichever frontend embeds it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ids::{CollectionId, ItemId, ResourceId, TagId};
use crate::scope::{Scope, ScopeContext};
use crate::value::{AttributeMap, Value};

/// Merge-matching key(s) accepted by `Append`/`Modify` style commands
/// (spec §4.4 "merge options ⊂ {Gid, Rid, Silent}").
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MergeOption {
    Gid,
    Rid,
    Silent,
}

/// How a set/add/remove field modification is expressed on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SetOp<T> {
    Set(Vec<T>),
    Add(Vec<T>),
    Remove(Vec<T>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PartInput {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppendItem {
    pub destination: CollectionId,
    pub remote_id: Option<String>,
    pub gid: Option<String>,
    pub mime_type: String,
    pub flags: HashSet<String>,
    pub tags: HashSet<TagId>,
    pub attributes: AttributeMap,
    pub parts: Vec<PartInput>,
    pub size_hint: i64,
    pub merge: HashSet<MergeOption>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModifyItem {
    pub scope: Scope,
    pub context: ScopeContext,
    pub flags: Option<SetOp<String>>,
    pub tags: Option<SetOp<TagId>>,
    pub attributes_add: AttributeMap,
    pub attributes_remove: Vec<String>,
    pub parts_add: Vec<PartInput>,
    pub parts_remove: Vec<String>,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    pub size: Option<i64>,
    pub clear_dirty: bool,
    pub invalidate_cache: bool,
    pub old_revision: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MoveItems {
    pub scope: Scope,
    pub context: ScopeContext,
    pub destination: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CopyItems {
    pub scope: Scope,
    pub context: ScopeContext,
    pub destination: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteItems {
    pub scope: Scope,
    pub context: ScopeContext,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FetchItems {
    pub scope: Scope,
    pub context: ScopeContext,
    pub requested_parts: Vec<String>,
    pub full_payload: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LinkItems {
    pub scope: Scope,
    pub context: ScopeContext,
    pub destination: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnlinkItems {
    pub scope: Scope,
    pub context: ScopeContext,
    pub destination: CollectionId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub enum TriState {
    #[default]
    Default,
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ListPreferences {
    pub display: TriState,
    pub sync: TriState,
    pub index: TriState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CachePolicyInput {
    pub inherit_from_parent: bool,
    pub check_interval_minutes: i64,
    pub cache_timeout_minutes: i64,
    pub local_parts: HashSet<String>,
    pub sync_on_demand: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CreateCollection {
    pub parent_id: CollectionId,
    pub name: String,
    pub resource_id: ResourceId,
    pub remote_id: Option<String>,
    pub content_mime_types: HashSet<String>,
    pub cache_policy: Option<CachePolicyInput>,
    pub is_virtual: bool,
    pub attributes: AttributeMap,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModifyCollection {
    pub collection_id: CollectionId,
    pub name: Option<String>,
    pub content_mime_types: Option<HashSet<String>>,
    pub cache_policy: Option<CachePolicyInput>,
    pub parent_id: Option<CollectionId>,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub query_string: Option<String>,
    pub query_attributes: Option<Vec<String>>,
    pub list_preferences: Option<ListPreferences>,
    pub attributes_add: AttributeMap,
    pub attributes_remove: Vec<String>,
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MoveCollection {
    pub collection_id: CollectionId,
    pub destination_parent: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteCollection {
    pub collection_id: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FetchCollections {
    pub scope: Scope,
    pub context: ScopeContext,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CreateTag {
    pub gid: String,
    pub tag_type: String,
    pub parent_id: Option<TagId>,
    pub attributes: AttributeMap,
    pub merge: bool,
    pub resource_id: Option<ResourceId>,
    pub remote_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModifyTag {
    pub tag_id: TagId,
    pub attributes_add: AttributeMap,
    pub attributes_remove: Vec<String>,
    pub parent_id: Option<Option<TagId>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteTag {
    pub tag_id: TagId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FetchTags {
    pub scope: Scope,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub search_id: String,
    pub scope: Scope,
    pub context: ScopeContext,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscribe {
    pub collection_id: CollectionId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Unsubscribe {
    pub collection_id: CollectionId,
}

/// A tagged command record (spec §6: "each command is a tagged record with
/// a command kind and a typed argument block").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Command {
    BeginTx,
    CommitTx,
    RollbackTx,
    CreateCollection(CreateCollection),
    ModifyCollection(ModifyCollection),
    MoveCollection(MoveCollection),
    DeleteCollection(DeleteCollection),
    FetchCollections(FetchCollections),
    CreateItem(AppendItem),
    ModifyItem(ModifyItem),
    MoveItems(MoveItems),
    CopyItems(CopyItems),
    DeleteItems(DeleteItems),
    FetchItems(FetchItems),
    LinkItems(LinkItems),
    UnlinkItems(UnlinkItems),
    CreateTag(CreateTag),
    DeleteTag(DeleteTag),
    ModifyTag(ModifyTag),
    FetchTags(FetchTags),
    SearchResult(SearchResult),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

/// Minimal facts about a created/modified item, returned on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ItemSummary {
    pub id: ItemId,
    pub revision: i64,
}

/// Success payload of a response, one variant per family of commands.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ResponseBody {
    Empty,
    Item(ItemSummary),
    Items(Vec<ItemSummary>),
    CollectionId(CollectionId),
    CollectionIds(Vec<CollectionId>),
    TagId(TagId),
    Ids(Vec<i64>),
    Value(Value),
}

/// Response keyed by the command tag that produced it (spec §6: "Responses
/// are success or failure records keyed by the same tag").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Response {
    Success(ResponseBody),
    Failure { kind: String, message: String },
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Response::Success(body)
    }
}

impl From<EngineError> for Response {
    fn from(err: EngineError) -> Self {
        Response::Failure {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Columns in a Collection's `CollectionChanged`/`ModifyCollection` diff.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangedPart {
    Name,
    ParentId,
    RemoteId,
    RemoteRevision,
    CachePolicy,
    Enabled,
    ContentMimeTypes,
    ListPreferences,
    QueryString,
    QueryAttributes,
    Flags,
    Attribute(String),
}

/// One push notification per committed event (spec §4.3). Carries enough
/// identifiers for a consumer to re-fetch the affected entity; it never
/// carries the entity's full state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ChangeEvent {
    CollectionAdded { collection_id: CollectionId },
    CollectionChanged { collection_id: CollectionId, changed_parts: HashSet<ChangedPart> },
    CollectionMoved { collection_id: CollectionId, source_parent: CollectionId, dest_parent: CollectionId },
    CollectionRemoved { collection_id: CollectionId },
    CollectionStatisticsChanged { collection_id: CollectionId },
    CollectionSubscribed { collection_id: CollectionId },
    CollectionUnsubscribed { collection_id: CollectionId },
    ItemAdded { item_id: ItemId, collection_id: CollectionId },
    ItemChanged { item_id: ItemId, collection_id: CollectionId, changed_parts: HashSet<String> },
    ItemsMoved { item_ids: Vec<ItemId>, source_collection: CollectionId, dest_collection: CollectionId },
    ItemRemoved { item_id: ItemId, collection_id: CollectionId },
    ItemsLinked { item_ids: Vec<ItemId>, destination: CollectionId },
    ItemsUnlinked { item_ids: Vec<ItemId>, destination: CollectionId },
    ItemsTagsChanged { item_ids: Vec<ItemId>, added: HashSet<TagId>, removed: HashSet<TagId> },
    ItemsRelationsChanged { item_ids: Vec<ItemId>, added: Vec<(ItemId, ItemId, String)>, removed: Vec<(ItemId, ItemId, String)> },
    TagAdded { tag_id: TagId },
    TagChanged { tag_id: TagId },
    TagRemoved { tag_id: TagId },
}

impl ChangeEvent {
    /// The single entity this event is "about", for ordering-guarantee
    /// checks (spec §4.3 rules 1-2: Added precedes, Removed is last).
    pub fn primary_entity(&self) -> EntityRef {
        match self {
            ChangeEvent::CollectionAdded { collection_id }
            | ChangeEvent::CollectionChanged { collection_id, .. }
            | ChangeEvent::CollectionRemoved { collection_id }
            | ChangeEvent::CollectionStatisticsChanged { collection_id }
            | ChangeEvent::CollectionSubscribed { collection_id }
            | ChangeEvent::CollectionUnsubscribed { collection_id } => {
                EntityRef::Collection(*collection_id)
            }
            ChangeEvent::CollectionMoved { collection_id, .. } => EntityRef::Collection(*collection_id),
            ChangeEvent::ItemAdded { item_id, .. }
            | ChangeEvent::ItemChanged { item_id, .. }
            | ChangeEvent::ItemRemoved { item_id, .. } => EntityRef::Item(*item_id),
            ChangeEvent::ItemsMoved { .. }
            | ChangeEvent::ItemsLinked { .. }
            | ChangeEvent::ItemsUnlinked { .. }
            | ChangeEvent::ItemsTagsChanged { .. }
            | ChangeEvent::ItemsRelationsChanged { .. } => EntityRef::Batch,
            ChangeEvent::TagAdded { tag_id }
            | ChangeEvent::TagChanged { tag_id }
            | ChangeEvent::TagRemoved { tag_id } => EntityRef::Tag(*tag_id),
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(
            self,
            ChangeEvent::CollectionRemoved { .. } | ChangeEvent::ItemRemoved { .. } | ChangeEvent::TagRemoved { .. }
        )
    }

    pub fn is_added(&self) -> bool {
        matches!(
            self,
            ChangeEvent::CollectionAdded { .. } | ChangeEvent::ItemAdded { .. } | ChangeEvent::TagAdded { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Collection(CollectionId),
    Item(ItemId),
    Tag(TagId),
    Batch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_from_engine_error_carries_kind() {
        let resp: Response = EngineError::NotFound.into();
        match resp {
            Response::Failure { kind, .. } => assert_eq!(kind, "NotFound"),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn change_event_primary_entity() {
        let ev = ChangeEvent::ItemAdded {
            item_id: ItemId(1),
            collection_id: CollectionId(2),
        };
        assert!(ev.is_added());
        assert!(matches!(ev.primary_entity(), EntityRef::Item(_)));
    }
}
