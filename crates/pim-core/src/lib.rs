//! Entity/schema types, the selection-scope query helper, and the
//! backend-agnostic traits shared between the storage layer and the
//! command handlers.

pub mod entities;
pub mod filter;
pub mod scope;

pub use entities::{
    CachePolicy, Collection, CollectionStatistics, Item, ListPreferences, Part,
    PartStorage, Relation, Resource, Tag, TagRemoteIdResourceRelation, TriState,
    VirtualMembership, TRIVIAL_MODIFY_FIELDS,
};
pub use filter::Filter;
pub use scope::{resolve_hrid, scope_to_query, HridResolver};
