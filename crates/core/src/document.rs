// Stract is an open source web search engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Per-call document view (C4, spec §4.4): resolves dotted/bracketed field
//! paths against a document's JSON tree and implements the sandbox's
//! [`wasm_udf::DocumentContext`] so a UDF can read fields by name without
//! the wasm-udf crate knowing anything about how documents are stored.

use std::sync::atomic::{AtomicUsize, Ordering};

use query_expr::TypedValue;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("empty path component")]
    EmptyComponent,

    #[error("malformed index in path component {0:?}")]
    MalformedIndex(String),
}

/// One parsed `name` or `name[index]` path component.
struct Component<'a> {
    name: &'a str,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<Component<'_>>, PathError> {
    path.split('.')
        .map(|raw| {
            if raw.is_empty() {
                return Err(PathError::EmptyComponent);
            }
            match raw.find('[') {
                None => Ok(Component { name: raw, index: None }),
                Some(open) => {
                    let close = raw.strip_suffix(']').ok_or_else(|| PathError::MalformedIndex(raw.to_string()))?;
                    if !close.ends_with(char::is_numeric) {
                        return Err(PathError::MalformedIndex(raw.to_string()));
                    }
                    let idx_str = &raw[open + 1..raw.len() - 1];
                    let idx = idx_str.parse::<usize>().map_err(|_| PathError::MalformedIndex(raw.to_string()))?;
                    Ok(Component { name: &raw[..open], index: Some(idx) })
                }
            }
        })
        .collect()
}

/// Walks `root` along `path`, returning `None` if any component is missing
/// or the tree shape doesn't match (object expected but found something
/// else, index out of bounds, etc).
fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let components = parse_path(path).ok()?;
    let mut current = root;
    for component in components {
        let next = current.as_object()?.get(component.name)?;
        current = match component.index {
            None => next,
            Some(idx) => next.as_array()?.get(idx)?,
        };
    }
    Some(current)
}

/// Infers a [`TypedValue`] from a resolved JSON leaf. Integers that fit in
/// an `i64` become `I64`; everything else numeric becomes `F64`. Arrays and
/// objects have no scalar representation and resolve to `None`.
fn typed_value_of(v: &Value) -> Option<TypedValue> {
    match v {
        Value::Bool(b) => Some(TypedValue::Bool(*b)),
        Value::String(s) => Some(TypedValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(TypedValue::I64(i))
            } else {
                n.as_f64().map(TypedValue::F64)
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// A single document's JSON body plus the per-call bookkeeping (document
/// id, score, field-access counter) a UDF invocation needs.
pub struct DocumentContext {
    id: String,
    body: Value,
    score: f64,
    accesses: AtomicUsize,
}

impl DocumentContext {
    pub fn new(id: impl Into<String>, body: Value, score: f64) -> Self {
        Self { id: id.into(), body, score, accesses: AtomicUsize::new(0) }
    }

    /// Resolved field value, or `None` if the path doesn't exist or the
    /// leaf has no scalar representation.
    pub fn get(&self, path: &str) -> Option<TypedValue> {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        resolve(&self.body, path).and_then(typed_value_of)
    }

    /// `true` iff every component of `path` resolves, regardless of
    /// whether the leaf has a scalar representation.
    pub fn has_field(&self, path: &str) -> bool {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        resolve(&self.body, path).is_some()
    }

    pub fn access_count(&self) -> usize {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

impl wasm_udf::DocumentContext for DocumentContext {
    fn get_field(&self, name: &str) -> Option<TypedValue> {
        self.get(name)
    }

    fn document_id(&self) -> &str {
        &self.id
    }

    fn score(&self) -> f64 {
        self.score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> DocumentContext {
        DocumentContext::new(
            "doc-1",
            json!({
                "title": "hello world",
                "views": 42,
                "rating": 4.5,
                "published": true,
                "tags": ["a", "b", "c"],
                "author": {"name": "ada", "id": 7},
            }),
            1.5,
        )
    }

    #[test]
    fn resolves_scalar_fields() {
        let d = doc();
        assert_eq!(d.get("title"), Some(TypedValue::String("hello world".into())));
        assert_eq!(d.get("views"), Some(TypedValue::I64(42)));
        assert_eq!(d.get("rating"), Some(TypedValue::F64(4.5)));
        assert_eq!(d.get("published"), Some(TypedValue::Bool(true)));
    }

    #[test]
    fn resolves_nested_and_indexed_paths() {
        let d = doc();
        assert_eq!(d.get("author.name"), Some(TypedValue::String("ada".into())));
        assert_eq!(d.get("tags[1]"), Some(TypedValue::String("b".into())));
        assert_eq!(d.get("author.id"), Some(TypedValue::I64(7)));
    }

    #[test]
    fn missing_and_malformed_paths_have_no_value() {
        let d = doc();
        assert_eq!(d.get("nope"), None);
        assert_eq!(d.get("author.missing"), None);
        assert_eq!(d.get("tags[99]"), None);
        // `title` is a string, not an object: indexing through it fails cleanly.
        assert_eq!(d.get("title.sub"), None);
    }

    #[test]
    fn has_field_reflects_existence_not_scalar_shape() {
        let d = doc();
        assert!(d.has_field("tags"));
        assert!(!d.has_field("tags[50]"));
        assert!(!d.has_field("title.sub"));
        assert!(d.has_field("author.name"));
    }

    #[test]
    fn access_counter_counts_every_lookup() {
        let d = doc();
        assert_eq!(d.access_count(), 0);
        d.get("title");
        d.has_field("views");
        d.get("nope");
        assert_eq!(d.access_count(), 3);
    }

    #[test]
    fn document_context_trait_impl_matches_accessors() {
        use wasm_udf::DocumentContext as _;
        let d = doc();
        assert_eq!(d.document_id(), "doc-1");
        assert_eq!(d.score(), 1.5);
        assert_eq!(wasm_udf::DocumentContext::get_field(&d, "views"), Some(TypedValue::I64(42)));
    }
}
