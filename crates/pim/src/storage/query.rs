//! Compiles a backend-agnostic [`pim_core::Filter`] into a SQL `WHERE`
//! fragment plus bound parameters.

use pim_api::Value;
use pim_core::Filter;

pub fn to_sql_value(v: &Value) -> turso::Value {
    match v {
        Value::String(s) => turso::Value::Text(s.clone()),
        Value::Integer(i) => turso::Value::Integer(*i),
        Value::Float(f) => turso::Value::Real(*f),
        Value::Boolean(b) => turso::Value::Integer(if *b { 1 } else { 0 }),
        Value::DateTime(s) => turso::Value::Text(s.clone()),
        Value::Bytes(b) => turso::Value::Blob(b.clone()),
        Value::Array(_) | Value::Object(_) => {
            turso::Value::Text(serde_json::to_string(v).unwrap_or_default())
        }
        Value::Null => turso::Value::Null,
    }
}

/// Returns `(where_clause, params)`. An empty clause means "no condition"
/// (the caller should omit the `WHERE`).
pub fn compile(filter: &Filter) -> (String, Vec<turso::Value>) {
    match filter {
        Filter::Eq(col, v) => (format!("{} = ?", col), vec![to_sql_value(v)]),
        Filter::In(col, values) => {
            if values.is_empty() {
                ("0".to_string(), vec![])
            } else {
                let placeholders = vec!["?"; values.len()].join(", ");
                (
                    format!("{} IN ({})", col, placeholders),
                    values.iter().map(to_sql_value).collect(),
                )
            }
        }
        Filter::And(conditions) => compile_bool(conditions, "AND", "1"),
        Filter::Or(conditions) => compile_bool(conditions, "OR", "0"),
        Filter::IsNull(col) => (format!("{} IS NULL", col), vec![]),
        Filter::IsNotNull(col) => (format!("{} IS NOT NULL", col), vec![]),
    }
}

fn compile_bool(conditions: &[Filter], joiner: &str, empty: &str) -> (String, Vec<turso::Value>) {
    if conditions.is_empty() {
        return (empty.to_string(), vec![]);
    }
    let mut clauses = Vec::with_capacity(conditions.len());
    let mut params = Vec::new();
    for c in conditions {
        let (clause, mut p) = compile(c);
        clauses.push(format!("({})", clause));
        params.append(&mut p);
    }
    (clauses.join(&format!(" {} ", joiner)), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_in_with_empty_list_to_false() {
        let (clause, params) = compile(&Filter::In("id".into(), vec![]));
        assert_eq!(clause, "0");
        assert!(params.is_empty());
    }

    #[test]
    fn compiles_eq() {
        let (clause, params) = compile(&Filter::Eq("name".into(), Value::String("a".into())));
        assert_eq!(clause, "name = ?");
        assert_eq!(params.len(), 1);
    }
}
