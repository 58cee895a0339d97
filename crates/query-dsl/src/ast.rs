//! Query AST (C3, spec §2/§3): OpenSearch-style query tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub gte: Option<Value>,
    pub gt: Option<Value>,
    pub lte: Option<Value>,
    pub lt: Option<Value>,
}

impl Range {
    pub fn is_empty(&self) -> bool {
        self.gte.is_none() && self.gt.is_none() && self.lte.is_none() && self.lt.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    pub should: Vec<Query>,
    pub must_not: Vec<Query>,
    pub filter: Vec<Query>,
    pub minimum_should_match: Option<i64>,
}

impl BoolQuery {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.should.is_empty() && self.must_not.is_empty() && self.filter.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WasmUdfQuery {
    pub name: String,
    pub version: Option<String>,
    pub parameters: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Match { field: String, value: String },
    Term { field: String, value: Value },
    Terms { field: String, values: Vec<Value> },
    Range { field: String, range: Range },
    Bool(Box<BoolQuery>),
    Prefix { field: String, value: String },
    Wildcard { field: String, value: String },
    Fuzzy { field: String, value: String, fuzziness: Option<i64> },
    MatchAll,
    MultiMatch { fields: Vec<String>, value: String },
    Exists { field: String },
    Expr { ast: query_expr::Expr, bytes: Vec<u8> },
    WasmUdf(WasmUdfQuery),
}

impl Query {
    /// term-level clauses contribute only match/no-match, never a score shape
    /// of their own; used to decide whether a clause can live in `filter`.
    pub fn is_term_level(&self) -> bool {
        match self {
            Query::Term { .. }
            | Query::Terms { .. }
            | Query::Range { .. }
            | Query::Exists { .. }
            | Query::Prefix { .. }
            | Query::Wildcard { .. }
            | Query::Expr { .. }
            | Query::WasmUdf(_) => true,
            Query::Bool(b) => {
                b.must.iter().all(Query::is_term_level)
                    && b.should.iter().all(Query::is_term_level)
                    && b.must_not.iter().all(Query::is_term_level)
                    && b.filter.iter().all(Query::is_term_level)
            }
            _ => false,
        }
    }

    pub fn can_use_filter(&self) -> bool {
        self.is_term_level()
    }
}
