//! Wire-level value type and operation/error vocabulary shared by every
//! layer of the engine: `pim-core`'s query helper and `pim`'s command
//! handlers both build on the types defined here rather than each growing
//! their own.

pub mod error;
pub mod ids;
pub mod scope;
pub mod value;
pub mod wire;

pub use error::{EngineError, Result};
pub use ids::{CollectionId, ItemId, ResourceId, TagId};
pub use scope::{HridStep, IdSet, Scope, ScopeContext};
pub use value::{AttributeMap, Value};
