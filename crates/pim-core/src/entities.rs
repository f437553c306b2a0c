//! Entities & Schema (spec §3): in-memory representation of the content
//! tree. Persistence for these types lives in `pim`'s storage module;
//! this crate only fixes their shape so every layer agrees on it.

use std::collections::HashSet;

use pim_api::{AttributeMap, CollectionId, ItemId, ResourceId, TagId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub is_virtual: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriState {
    #[default]
    Default,
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListPreferences {
    pub display: TriState,
    pub sync: TriState,
    pub index: TriState,
}

/// `check_interval_minutes`/`cache_timeout_minutes == -1` means "never"/"forever".
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CachePolicy {
    pub inherit_from_parent: bool,
    pub check_interval_minutes: i64,
    pub cache_timeout_minutes: i64,
    pub local_parts: HashSet<String>,
    pub sync_on_demand: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            inherit_from_parent: true,
            check_interval_minutes: -1,
            cache_timeout_minutes: -1,
            local_parts: HashSet::new(),
            sync_on_demand: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    pub id: CollectionId,
    pub parent_id: Option<CollectionId>,
    pub name: String,
    pub remote_id: String,
    pub remote_revision: String,
    pub resource_id: ResourceId,
    pub is_virtual: bool,
    pub content_mime_types: HashSet<String>,
    pub cache_policy: CachePolicy,
    pub enabled: bool,
    pub list_preferences: ListPreferences,
    pub query_string: Option<String>,
    pub query_attributes: Vec<String>,
    pub query_collection_ids: Vec<CollectionId>,
    pub attributes: AttributeMap,
}

impl Collection {
    pub fn is_search_collection(&self) -> bool {
        self.query_string.is_some() || !self.query_collection_ids.is_empty()
    }
}

/// Computed on demand (spec §4 supplement), never persisted.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionStatistics {
    pub count: i64,
    pub unseen_count: i64,
    pub size: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartStorage {
    Internal,
    External,
    Foreign,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Part {
    pub item_id: ItemId,
    pub name: String,
    pub data: Option<Vec<u8>>,
    pub storage: PartStorage,
    pub external_ref: Option<String>,
    pub size: i64,
}

impl Part {
    pub const PAYLOAD_PREFIX: &'static str = "PLD:";

    pub fn is_payload(&self) -> bool {
        self.name.starts_with(Self::PAYLOAD_PREFIX)
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub collection_id: CollectionId,
    pub mime_type: String,
    pub remote_id: String,
    pub remote_revision: String,
    pub gid: String,
    pub revision: i64,
    pub created: String,
    pub modified: String,
    pub size: i64,
    pub dirty: bool,
    pub flags: HashSet<String>,
    pub tags: HashSet<TagId>,
    pub attributes: AttributeMap,
}

/// The subset of an item's fields a trivial modification (§3 invariant 4)
/// may touch without bumping `revision`.
pub const TRIVIAL_MODIFY_FIELDS: [&str; 3] = ["remote_id", "remote_revision", "gid"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub id: TagId,
    pub gid: String,
    pub tag_type: String,
    pub parent_id: Option<TagId>,
    pub attributes: AttributeMap,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TagRemoteIdResourceRelation {
    pub tag_id: TagId,
    pub resource_id: ResourceId,
    pub remote_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Relation {
    pub left_item: ItemId,
    pub right_item: ItemId,
    pub relation_type: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VirtualMembership {
    pub collection_id: CollectionId,
    pub item_id: ItemId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_payload_naming() {
        let part = Part {
            item_id: ItemId(1),
            name: "PLD:RFC822".into(),
            data: Some(vec![1, 2, 3]),
            storage: PartStorage::Internal,
            external_ref: None,
            size: 3,
        };
        assert!(part.is_payload());
        assert!(part.has_data());
    }

    #[test]
    fn cache_policy_default_never_expires() {
        let policy = CachePolicy::default();
        assert_eq!(policy.check_interval_minutes, -1);
        assert_eq!(policy.cache_timeout_minutes, -1);
    }
}
