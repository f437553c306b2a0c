//! Wires [`pim_core::HridResolver`] to the relational store and resolves a
//! whole [`Scope`] (including the `Hrid` variant, which `scope_to_query`
//! alone cannot do without store access) into a [`Filter`].

use async_trait::async_trait;
use pim_api::{CollectionId, EngineError, Scope, ScopeContext, Value};
use pim_core::{scope_to_query, Filter, HridResolver};

use crate::errors::Result;
use crate::storage::repo;

pub struct StoreHridResolver<'a> {
    pub conn: &'a turso::Connection,
}

#[async_trait]
impl<'a> HridResolver for StoreHridResolver<'a> {
    async fn candidates(
        &self,
        resource_id: i64,
        rid: &str,
        parent: Option<i64>,
    ) -> std::result::Result<Vec<i64>, EngineError> {
        repo::collections_by_resource_rid(self.conn, resource_id, rid, parent)
            .await
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }
}

/// Resolves any scope variant to a [`Filter`], consulting the store for
/// hierarchical remote-id chains (spec §4.1).
pub async fn resolve_scope(
    conn: &turso::Connection,
    scope: &Scope,
    context: &ScopeContext,
) -> Result<Filter> {
    if let Scope::Hrid(chain) = scope {
        let resolver = StoreHridResolver { conn };
        let collection_id = pim_core::resolve_hrid(chain, context, &resolver).await?;
        return Ok(Filter::Eq(
            "id".into(),
            Value::Integer(CollectionId(collection_id).get()),
        ));
    }
    Ok(scope_to_query(scope, context)?)
}
