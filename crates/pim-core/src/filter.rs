//! Relational filter conditions, backend-agnostic.
//!
//! Mirrors the teacher's `storage::types::Filter` shape: a small tree of
//! conditions a concrete backend (in `pim`) compiles to SQL.

use pim_api::Value;

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    IsNull(String),
    IsNotNull(String),
}

impl Filter {
    pub fn and(conditions: impl IntoIterator<Item = Filter>) -> Filter {
        let conditions: Vec<_> = conditions.into_iter().collect();
        match conditions.len() {
            0 => Filter::And(vec![]),
            1 => conditions.into_iter().next().unwrap(),
            _ => Filter::And(conditions),
        }
    }

    pub fn is_empty_and(&self) -> bool {
        matches!(self, Filter::And(v) if v.is_empty())
    }
}
