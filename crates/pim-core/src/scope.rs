//! Query Helper (spec §4.1): turns a [`Scope`] into a [`Filter`] tree.
//!
//! Hierarchical-rid resolution needs to consult the store one level at a
//! time, so it is expressed against a small [`HridResolver`] trait rather
//! than a concrete backend — `pim`'s storage layer implements it.

use async_trait::async_trait;
use pim_api::{EngineError, HridStep, Scope, ScopeContext, Value};

use crate::filter::Filter;

/// Resolves one step of a hierarchical remote-id chain against the store.
/// `parent` is `None` only for the root-terminating step.
#[async_trait]
pub trait HridResolver: Send + Sync {
    /// Candidate collection ids whose `remote_id == rid` within `resource`,
    /// constrained to children of `parent` (or root collections if `parent`
    /// is `None`).
    async fn candidates(
        &self,
        resource_id: i64,
        rid: &str,
        parent: Option<i64>,
    ) -> Result<Vec<i64>, EngineError>;
}

/// Non-hierarchical scopes resolve to a filter with no store access.
pub fn scope_to_query(scope: &Scope, context: &ScopeContext) -> Result<Filter, EngineError> {
    match scope {
        Scope::Uid(ids) => {
            if ids.is_empty() {
                if context.tag_id.is_some() || context.collection_id.is_some() {
                    return Ok(Filter::And(vec![]));
                }
                return Ok(Filter::In("id".into(), vec![]));
            }
            Ok(Filter::In(
                "id".into(),
                ids.iter().map(Value::Integer).collect(),
            ))
        }
        Scope::Rid(rids) => {
            let mut conditions = vec![rid_filter(rids)];
            conditions.push(context_filter(context)?);
            Ok(Filter::and(conditions))
        }
        Scope::Hrid(_) => Err(EngineError::ContextRequired),
        Scope::Gid(gids) => {
            let mut conditions = vec![Filter::In(
                "gid".into(),
                gids.iter().map(|g| Value::String(g.clone())).collect(),
            )];
            if let Some(tag_id) = context.tag_id {
                conditions.push(Filter::Eq("tag_id".into(), Value::Integer(tag_id.get())));
                if let Some(resource_id) = context.resource_id {
                    conditions.push(Filter::Eq(
                        "resource_id".into(),
                        Value::Integer(resource_id.get()),
                    ));
                }
            }
            Ok(Filter::and(conditions))
        }
    }
}

fn rid_filter(rids: &[String]) -> Filter {
    if rids.len() == 1 {
        Filter::Eq("remote_id".into(), Value::String(rids[0].clone()))
    } else {
        Filter::In(
            "remote_id".into(),
            rids.iter().map(|r| Value::String(r.clone())).collect(),
        )
    }
}

fn context_filter(context: &ScopeContext) -> Result<Filter, EngineError> {
    if let Some(resource_id) = context.resource_id {
        Ok(Filter::Eq(
            "resource_id".into(),
            Value::Integer(resource_id.get()),
        ))
    } else if let Some(collection_id) = context.collection_id {
        Ok(Filter::Eq(
            "collection_id".into(),
            Value::Integer(collection_id.get()),
        ))
    } else {
        Err(EngineError::ContextRequired)
    }
}

/// Walks a hierarchical-rid chain (leaf to root-terminator) and resolves it
/// to a single collection id, per spec §4.1: "fails if zero or >1 candidates
/// at any level, or if the chain is not root-terminated".
pub async fn resolve_hrid(
    chain: &[HridStep],
    context: &ScopeContext,
    resolver: &dyn HridResolver,
) -> Result<i64, EngineError> {
    let resource_id = context.resource_id.ok_or(EngineError::ContextRequired)?;
    if chain.is_empty() {
        return Err(EngineError::NotFound);
    }
    // Walk root-to-leaf: reverse the leaf-to-root chain first.
    let mut parent: Option<i64> = None;
    for step in chain.iter().rev() {
        let candidates = resolver
            .candidates(resource_id.get(), &step.0, parent)
            .await?;
        match candidates.as_slice() {
            [] => return Err(EngineError::NotFound),
            [single] => parent = Some(*single),
            _ => return Err(EngineError::Ambiguous),
        }
    }
    parent.ok_or(EngineError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pim_api::{CollectionId, IdSet, ResourceId};

    struct FakeResolver {
        // leaf-to-root resolution table keyed by (parent, rid) -> child id
        edges: Vec<((Option<i64>, &'static str), i64)>,
    }

    #[async_trait]
    impl HridResolver for FakeResolver {
        async fn candidates(
            &self,
            _resource_id: i64,
            rid: &str,
            parent: Option<i64>,
        ) -> Result<Vec<i64>, EngineError> {
            Ok(self
                .edges
                .iter()
                .filter(|((p, r), _)| *p == parent && *r == rid)
                .map(|(_, id)| *id)
                .collect())
        }
    }

    #[test]
    fn uid_scope_builds_in_filter() {
        let scope = Scope::Uid(IdSet::from_ids([1, 2, 3]));
        let context = ScopeContext::default();
        let filter = scope_to_query(&scope, &context).unwrap();
        assert!(matches!(filter, Filter::In(col, vals) if col == "id" && vals.len() == 3));
    }

    #[test]
    fn rid_scope_without_context_fails() {
        let scope = Scope::Rid(vec!["abc".into()]);
        let context = ScopeContext::default();
        assert!(matches!(
            scope_to_query(&scope, &context),
            Err(EngineError::ContextRequired)
        ));
    }

    #[test]
    fn rid_scope_with_resource_context() {
        let scope = Scope::Rid(vec!["abc".into()]);
        let context = ScopeContext {
            resource_id: Some(ResourceId(1)),
            ..Default::default()
        };
        let filter = scope_to_query(&scope, &context).unwrap();
        assert!(matches!(filter, Filter::And(_)));
    }

    #[tokio::test]
    async fn hrid_resolves_root_to_leaf() {
        let resolver = FakeResolver {
            edges: vec![((None, "top"), 1), ((Some(1), "mid"), 2), ((Some(2), "leaf"), 3)],
        };
        let chain = vec![
            HridStep("leaf".into()),
            HridStep("mid".into()),
            HridStep("top".into()),
        ];
        let context = ScopeContext {
            resource_id: Some(ResourceId(1)),
            ..Default::default()
        };
        let resolved = resolve_hrid(&chain, &context, &resolver).await.unwrap();
        assert_eq!(resolved, 3);
        let _ = CollectionId(resolved);
    }

    #[tokio::test]
    async fn hrid_ambiguous_fails() {
        let resolver = FakeResolver {
            edges: vec![((None, "top"), 1), ((None, "top"), 2)],
        };
        let chain = vec![HridStep("top".into())];
        let context = ScopeContext {
            resource_id: Some(ResourceId(1)),
            ..Default::default()
        };
        assert!(matches!(
            resolve_hrid(&chain, &context, &resolver).await,
            Err(EngineError::Ambiguous)
        ));
    }
}
