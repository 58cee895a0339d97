//! DSL parser (C3, spec §4.3): JSON query body into a normalized [`Query`]
//! tree, plus the helper predicates the coordinator/shard rely on.

use serde_json::Value;

use crate::ast::{BoolQuery, Query, Range, WasmUdfQuery};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("query node is not a JSON object")]
    NotAnObject,

    #[error("query node must contain exactly one query-type key, found: {0:?}")]
    NotExactlyOneKey(Vec<String>),

    #[error("unknown query type {0:?}")]
    UnknownQueryType(String),

    #[error("`{clause}` clause must not be empty")]
    EmptyClause { clause: &'static str },

    #[error("`range` requires at least one bound")]
    RangeNeedsBound,

    #[error("`bool` requires at least one clause in must/should/must_not/filter")]
    BoolNeedsClause,

    #[error("`wasm_udf` requires a `name`")]
    WasmUdfNeedsName,

    #[error("field {0:?} must be a string")]
    FieldMustBeString(&'static str),

    #[error(transparent)]
    Expr(#[from] query_expr::Error),
}

fn as_str_field(obj: &serde_json::Map<String, Value>, key: &'static str) -> Result<String, Error> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(Error::FieldMustBeString(key))
}

fn one_or_many(v: Option<&Value>) -> Result<Vec<Query>, Error> {
    match v {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse).collect(),
        Some(other) => Ok(vec![parse(other)?]),
    }
}

pub fn parse(v: &Value) -> Result<Query, Error> {
    let obj = v.as_object().ok_or(Error::NotAnObject)?;
    if obj.len() != 1 {
        return Err(Error::NotExactlyOneKey(obj.keys().cloned().collect()));
    }
    let (key, body) = obj.iter().next().unwrap();

    match key.as_str() {
        "match_all" => Ok(Query::MatchAll),
        "match" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, value) = body.iter().next().ok_or(Error::EmptyClause { clause: "match" })?;
            let value = value.as_str().ok_or(Error::FieldMustBeString("match"))?;
            if value.is_empty() {
                return Err(Error::EmptyClause { clause: "match" });
            }
            Ok(Query::Match { field: field.clone(), value: value.to_string() })
        }
        "term" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, value) = body.iter().next().ok_or(Error::EmptyClause { clause: "term" })?;
            Ok(Query::Term { field: field.clone(), value: value.clone() })
        }
        "terms" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, values) = body.iter().next().ok_or(Error::EmptyClause { clause: "terms" })?;
            let values = values.as_array().ok_or(Error::FieldMustBeString("terms"))?.clone();
            if values.is_empty() {
                return Err(Error::EmptyClause { clause: "terms" });
            }
            Ok(Query::Terms { field: field.clone(), values })
        }
        "range" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, bounds) = body.iter().next().ok_or(Error::EmptyClause { clause: "range" })?;
            let bounds = bounds.as_object().ok_or(Error::NotAnObject)?;
            let range = Range {
                gte: bounds.get("gte").cloned(),
                gt: bounds.get("gt").cloned(),
                lte: bounds.get("lte").cloned(),
                lt: bounds.get("lt").cloned(),
            };
            if range.is_empty() {
                return Err(Error::RangeNeedsBound);
            }
            Ok(Query::Range { field: field.clone(), range })
        }
        "bool" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let must = one_or_many(body.get("must"))?;
            let should = one_or_many(body.get("should"))?;
            let must_not = one_or_many(body.get("must_not"))?;
            let filter = one_or_many(body.get("filter"))?;
            let minimum_should_match = match body.get("minimum_should_match") {
                None => None,
                Some(Value::Number(n)) => n.as_i64(),
                Some(Value::String(s)) => s.parse::<i64>().ok(),
                Some(_) => None,
            };
            let b = BoolQuery { must, should, must_not, filter, minimum_should_match };
            if b.is_empty() {
                return Err(Error::BoolNeedsClause);
            }
            Ok(Query::Bool(Box::new(b)))
        }
        "prefix" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, value) = body.iter().next().ok_or(Error::EmptyClause { clause: "prefix" })?;
            let value = value.as_str().ok_or(Error::FieldMustBeString("prefix"))?.to_string();
            Ok(Query::Prefix { field: field.clone(), value })
        }
        "wildcard" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, value) = body.iter().next().ok_or(Error::EmptyClause { clause: "wildcard" })?;
            let value = value.as_str().ok_or(Error::FieldMustBeString("wildcard"))?.to_string();
            Ok(Query::Wildcard { field: field.clone(), value })
        }
        "fuzzy" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let (field, spec) = body.iter().next().ok_or(Error::EmptyClause { clause: "fuzzy" })?;
            let (value, fuzziness) = match spec {
                Value::String(s) => (s.clone(), None),
                Value::Object(o) => (
                    o.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
                    o.get("fuzziness").and_then(Value::as_i64),
                ),
                _ => return Err(Error::FieldMustBeString("fuzzy")),
            };
            Ok(Query::Fuzzy { field: field.clone(), value, fuzziness })
        }
        "multi_match" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let value = as_str_field(body, "query")?;
            let fields = body
                .get("fields")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            Ok(Query::MultiMatch { fields, value })
        }
        "exists" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let field = as_str_field(body, "field")?;
            Ok(Query::Exists { field })
        }
        "expr" => {
            let (ast, bytes) = query_expr::compile(body)?;
            Ok(Query::Expr { ast, bytes })
        }
        "wasm_udf" => {
            let body = body.as_object().ok_or(Error::NotAnObject)?;
            let name = body.get("name").and_then(Value::as_str).ok_or(Error::WasmUdfNeedsName)?.to_string();
            let version = body.get("version").and_then(Value::as_str).map(str::to_string);
            let parameters = body
                .get("parameters")
                .or_else(|| body.get("params"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Ok(Query::WasmUdf(WasmUdfQuery { name, version, parameters }))
        }
        other => Err(Error::UnknownQueryType(other.to_string())),
    }
}

pub fn fields_of(query: &Query) -> Vec<String> {
    match query {
        Query::Match { field, .. }
        | Query::Term { field, .. }
        | Query::Terms { field, .. }
        | Query::Range { field, .. }
        | Query::Prefix { field, .. }
        | Query::Wildcard { field, .. }
        | Query::Fuzzy { field, .. }
        | Query::Exists { field } => vec![field.clone()],
        Query::MultiMatch { fields, .. } => fields.clone(),
        Query::Bool(b) => b
            .must
            .iter()
            .chain(b.should.iter())
            .chain(b.must_not.iter())
            .chain(b.filter.iter())
            .flat_map(fields_of)
            .collect(),
        Query::MatchAll | Query::Expr { .. } | Query::WasmUdf(_) => Vec::new(),
    }
}

/// An ordinal complexity estimate for admission/logging — not query semantics.
pub fn estimate_complexity(query: &Query) -> u32 {
    match query {
        Query::MatchAll | Query::Exists { .. } => 1,
        Query::Term { .. } | Query::Terms { .. } | Query::Range { .. } | Query::Prefix { .. } => 2,
        Query::Match { .. } | Query::Wildcard { .. } | Query::Fuzzy { .. } => 3,
        Query::MultiMatch { fields, .. } => 2 + fields.len() as u32,
        Query::Expr { .. } => 4,
        Query::WasmUdf(_) => 8,
        Query::Bool(b) => {
            1 + b
                .must
                .iter()
                .chain(b.should.iter())
                .chain(b.must_not.iter())
                .chain(b.filter.iter())
                .map(estimate_complexity)
                .sum::<u32>()
        }
    }
}

pub fn can_use_filter(query: &Query) -> bool {
    query.can_use_filter()
}

/// Flattens a `must` containing a single bool with no `should` clauses into
/// its parent, the way the teacher's optic-query simplifier flattens
/// redundant nesting.
pub fn simplify(query: Query) -> Query {
    match query {
        Query::Bool(b) => {
            let mut b = *b;
            b.must = b.must.into_iter().map(simplify).collect();
            b.should = b.should.into_iter().map(simplify).collect();
            b.must_not = b.must_not.into_iter().map(simplify).collect();
            b.filter = b.filter.into_iter().map(simplify).collect();

            if b.must.len() == 1 && b.should.is_empty() && b.must_not.is_empty() && b.filter.is_empty() {
                if let Query::Bool(inner) = &b.must[0] {
                    if inner.should.is_empty() {
                        return simplify(Query::Bool(Box::new(BoolQuery {
                            must: inner.must.clone(),
                            should: Vec::new(),
                            must_not: inner.must_not.clone(),
                            filter: inner.filter.clone(),
                            minimum_should_match: b.minimum_should_match,
                        })));
                    }
                }
            }

            Query::Bool(Box::new(b))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_match_all() {
        assert_eq!(parse(&json!({"match_all": {}})).unwrap(), Query::MatchAll);
    }

    #[test]
    fn range_requires_a_bound() {
        assert!(parse(&json!({"range": {"value": {}}})).is_err());
        assert!(parse(&json!({"range": {"value": {"gte": 1}}})).is_ok());
    }

    #[test]
    fn bool_requires_a_clause() {
        assert!(parse(&json!({"bool": {}})).is_err());
        assert!(parse(&json!({"bool": {"must": [{"match_all": {}}]}})).is_ok());
    }

    #[test]
    fn bool_accepts_object_or_array_clauses() {
        let single = parse(&json!({"bool": {"must": {"match_all": {}}}})).unwrap();
        let array = parse(&json!({"bool": {"must": [{"match_all": {}}]}})).unwrap();
        assert_eq!(single, array);
    }

    #[test]
    fn wasm_udf_requires_name() {
        assert!(parse(&json!({"wasm_udf": {}})).is_err());
        assert!(parse(&json!({"wasm_udf": {"name": "always_true"}})).is_ok());
    }

    #[test]
    fn fields_of_collects_nested_bool() {
        let q = parse(&json!({
            "bool": {
                "must": [{"term": {"category": "electronics"}}],
                "filter": [{"range": {"price": {"gte": 100, "lte": 500}}}]
            }
        }))
        .unwrap();
        let mut fields = fields_of(&q);
        fields.sort();
        assert_eq!(fields, vec!["category".to_string(), "price".to_string()]);
    }

    #[test]
    fn simplify_flattens_single_nested_must() {
        let q = parse(&json!({
            "bool": {"must": [{"bool": {"must": [{"term": {"a": 1}}]}}]}
        }))
        .unwrap();
        let simplified = simplify(q);
        match simplified {
            Query::Bool(b) => assert_eq!(b.must.len(), 1),
            _ => panic!("expected bool"),
        }
    }
}
