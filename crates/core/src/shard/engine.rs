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

//! Native index engine contract (C12) and the single in-process reference
//! implementation the shard plane is built and tested against. A real
//! engine is an opaque library the shard only ever calls through this
//! trait; `MemEngine` is the pinned stand-in used in place of one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use query_dsl::{BoolQuery, Query, Range};
use query_expr::{BinaryOp, Expr, Func, TypedValue, UnaryOp};
use serde_json::Value;

use crate::document::DocumentContext;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("document {0:?} does not exist")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

/// The operations a shard needs from whatever stores and retrieves its
/// documents. Kept intentionally small: everything ranking- or
/// storage-engine-specific stays behind this seam.
pub trait Engine: Send + Sync {
    fn index_document(&self, id: &str, doc: Value) -> Result<bool, EngineError>;
    fn get_document(&self, id: &str) -> Result<(Option<Value>, bool), EngineError>;
    fn delete_document(&self, id: &str) -> Result<bool, EngineError>;
    /// Matches `query` against the corpus (or, if given, only against
    /// `candidate_ids`) and returns scored hits in no particular order —
    /// the caller sorts.
    fn search(&self, query: &Query, candidate_ids: Option<&[String]>) -> Result<Vec<ScoredDoc>, EngineError>;
    fn refresh(&self) -> Result<(), EngineError>;
    fn commit(&self) -> Result<(), EngineError>;
    fn close(&self) -> Result<(), EngineError>;
    fn doc_count(&self) -> usize;
}

/// In-memory reference engine. Writes are visible to reads immediately;
/// `refresh` is a no-op snapshot swap (there is nothing to swap — reads
/// already see the latest state); `commit` fsyncs a JSON snapshot of the
/// whole document map to `<shard_dir>/snapshot.bin`.
pub struct MemEngine {
    dir: PathBuf,
    docs: RwLock<HashMap<String, Value>>,
}

const SNAPSHOT_FILE: &str = "snapshot.bin";

impl MemEngine {
    pub fn open_or_create(dir: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(dir)?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let docs = if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)?;
            if bytes.is_empty() {
                HashMap::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            HashMap::new()
        };
        Ok(Self { dir: dir.to_path_buf(), docs: RwLock::new(docs) })
    }
}

impl Engine for MemEngine {
    fn index_document(&self, id: &str, doc: Value) -> Result<bool, EngineError> {
        let existed = self.docs.write().insert(id.to_string(), doc).is_some();
        Ok(existed)
    }

    fn get_document(&self, id: &str) -> Result<(Option<Value>, bool), EngineError> {
        let docs = self.docs.read();
        match docs.get(id) {
            Some(v) => Ok((Some(v.clone()), true)),
            None => Ok((None, false)),
        }
    }

    fn delete_document(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.docs.write().remove(id).is_some())
    }

    fn search(&self, query: &Query, candidate_ids: Option<&[String]>) -> Result<Vec<ScoredDoc>, EngineError> {
        let docs = self.docs.read();
        let ids: Vec<&String> = match candidate_ids {
            Some(ids) => ids.iter().collect(),
            None => docs.keys().collect(),
        };
        let mut hits = Vec::new();
        for id in ids {
            let Some(source) = docs.get(id) else { continue };
            let ctx = DocumentContext::new(id.clone(), source.clone(), 0.0);
            if let Some(score) = score_query(query, &ctx) {
                hits.push(ScoredDoc { id: id.clone(), score, source: source.clone() });
            }
        }
        Ok(hits)
    }

    fn refresh(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn commit(&self) -> Result<(), EngineError> {
        let docs = self.docs.read();
        let bytes = serde_json::to_vec(&*docs)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            use std::io::Write;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.commit()
    }

    fn doc_count(&self) -> usize {
        self.docs.read().len()
    }
}

/// `Some(score)` if `doc` matches `query`, `None` otherwise. `1.0` is the
/// uniform match score for every clause type except `expr`, which scores
/// with its own numeric result when it has one — ranking fidelity is out
/// of scope, only match/no-match and expr-as-score need to hold.
fn score_query(query: &Query, ctx: &DocumentContext) -> Option<f64> {
    match query {
        Query::MatchAll => Some(1.0),
        Query::Match { field, value } => text_contains_any_term(ctx, std::slice::from_ref(field), value).then_some(1.0),
        Query::MultiMatch { fields, value } => text_contains_any_term(ctx, fields, value).then_some(1.0),
        Query::Term { field, value } => field_equals(ctx, field, value).then_some(1.0),
        Query::Terms { field, values } => values.iter().any(|v| field_equals(ctx, field, v)).then_some(1.0),
        Query::Range { field, range } => field_in_range(ctx, field, range).then_some(1.0),
        Query::Prefix { field, value } => field_str_matches(ctx, field, |s| s.starts_with(value.as_str())).then_some(1.0),
        Query::Wildcard { field, value } => field_str_matches(ctx, field, |s| wildcard_match(value, s)).then_some(1.0),
        Query::Fuzzy { field, value, fuzziness } => {
            let max_dist = fuzziness.unwrap_or(2).max(0) as usize;
            field_str_matches(ctx, field, |s| levenshtein(value, s) <= max_dist).then_some(1.0)
        }
        Query::Exists { field } => ctx.has_field(field).then_some(1.0),
        Query::Bool(b) => score_bool(b, ctx),
        Query::Expr { ast, .. } => match eval_expr(ast, ctx) {
            Some(TypedValue::Bool(true)) => Some(1.0),
            Some(TypedValue::Bool(false)) | None => None,
            Some(TypedValue::I64(n)) => Some(n as f64),
            Some(TypedValue::I32(n)) => Some(n as f64),
            Some(TypedValue::F64(n)) => Some(n),
            Some(TypedValue::String(_)) => Some(1.0),
        },
        // UDF-backed clauses are resolved by the shard's post-filter pass,
        // never by the engine directly — it has no registry to call into.
        Query::WasmUdf(_) => Some(1.0),
    }
}

fn text_contains_any_term(ctx: &DocumentContext, fields: &[String], value: &str) -> bool {
    let needle = value.to_lowercase();
    let terms: Vec<&str> = needle.split_whitespace().collect();
    fields.iter().any(|f| match ctx.get(f) {
        Some(TypedValue::String(s)) => {
            let haystack = s.to_lowercase();
            terms.iter().any(|t| haystack.contains(t))
        }
        _ => false,
    })
}

fn field_equals(ctx: &DocumentContext, field: &str, value: &Value) -> bool {
    match (ctx.get(field), value) {
        (Some(TypedValue::String(s)), Value::String(v)) => &s == v,
        (Some(TypedValue::I64(n)), Value::Number(v)) => v.as_i64() == Some(n),
        (Some(TypedValue::F64(n)), Value::Number(v)) => v.as_f64() == Some(n),
        (Some(TypedValue::Bool(b)), Value::Bool(v)) => b == *v,
        _ => false,
    }
}

fn field_in_range(ctx: &DocumentContext, field: &str, range: &Range) -> bool {
    let Some(v) = ctx.get(field) else { return false };
    let n = match v {
        TypedValue::I64(n) => n as f64,
        TypedValue::I32(n) => n as f64,
        TypedValue::F64(n) => n,
        _ => return false,
    };
    let as_f64 = |v: &Value| v.as_f64();
    if let Some(gte) = range.gte.as_ref().and_then(as_f64) {
        if n < gte {
            return false;
        }
    }
    if let Some(gt) = range.gt.as_ref().and_then(as_f64) {
        if n <= gt {
            return false;
        }
    }
    if let Some(lte) = range.lte.as_ref().and_then(as_f64) {
        if n > lte {
            return false;
        }
    }
    if let Some(lt) = range.lt.as_ref().and_then(as_f64) {
        if n >= lt {
            return false;
        }
    }
    true
}

fn field_str_matches(ctx: &DocumentContext, field: &str, pred: impl Fn(&str) -> bool) -> bool {
    match ctx.get(field) {
        Some(TypedValue::String(s)) => pred(&s),
        _ => false,
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => go(&p[1..], t) || (!t.is_empty() && go(p, &t[1..])),
            Some(b'?') => !t.is_empty() && go(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && go(&p[1..], &t[1..]),
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut cur = vec![i; b.len() + 1];
        for j in 1..=b.len() {
            cur[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1]
            } else {
                1 + prev[j - 1].min(prev[j]).min(cur[j - 1])
            };
        }
        prev = cur;
    }
    prev[b.len()]
}

fn score_bool(b: &BoolQuery, ctx: &DocumentContext) -> Option<f64> {
    for clause in &b.must_not {
        if score_query(clause, ctx).is_some() {
            return None;
        }
    }
    for clause in &b.filter {
        score_query(clause, ctx)?;
    }
    let mut score = 0.0;
    for clause in &b.must {
        score += score_query(clause, ctx)?;
    }
    let mut matched_should = 0;
    for clause in &b.should {
        if let Some(s) = score_query(clause, ctx) {
            score += s;
            matched_should += 1;
        }
    }
    let min_should = b.minimum_should_match.unwrap_or(if b.must.is_empty() && b.filter.is_empty() && !b.should.is_empty() { 1 } else { 0 });
    if matched_should < min_should {
        return None;
    }
    if b.must.is_empty() && b.filter.is_empty() && b.should.is_empty() {
        // bool with only must_not is valid: matches everything not excluded.
        return Some(1.0);
    }
    Some(score.max(1.0))
}

/// Evaluates a validated [`Expr`] against a document, returning its
/// [`TypedValue`] result. Numeric operands are widened to `f64`; string
/// operands only ever participate in `Eq`/`Ne`.
fn eval_expr(expr: &Expr, ctx: &DocumentContext) -> Option<TypedValue> {
    match expr {
        Expr::Const(v, _) => Some(v.clone()),
        Expr::Field(path, _) => ctx.get(path),
        Expr::UnaryOp(op, inner, _) => {
            let v = eval_expr(inner, ctx)?;
            match op {
                UnaryOp::Neg => Some(TypedValue::F64(-as_f64(&v)?)),
                UnaryOp::Not => Some(TypedValue::Bool(!as_bool(&v)?)),
            }
        }
        Expr::BinaryOp(op, lhs, rhs, _) => {
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            eval_binary(*op, &l, &r)
        }
        Expr::Ternary(cond, then, els, _) => {
            let c = eval_expr(cond, ctx)?;
            if as_bool(&c)? {
                eval_expr(then, ctx)
            } else {
                eval_expr(els, ctx)
            }
        }
        Expr::Function(func, args, _) => {
            let values: Option<Vec<f64>> = args.iter().map(|a| eval_expr(a, ctx).and_then(|v| as_f64(&v))).collect();
            let values = values?;
            eval_func(*func, &values).map(TypedValue::F64)
        }
    }
}

fn as_f64(v: &TypedValue) -> Option<f64> {
    match v {
        TypedValue::I64(n) => Some(*n as f64),
        TypedValue::I32(n) => Some(*n as f64),
        TypedValue::F64(n) => Some(*n),
        TypedValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        TypedValue::String(_) => None,
    }
}

fn as_bool(v: &TypedValue) -> Option<bool> {
    match v {
        TypedValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn eval_binary(op: BinaryOp, l: &TypedValue, r: &TypedValue) -> Option<TypedValue> {
    if op.is_logical() {
        return Some(TypedValue::Bool(match op {
            BinaryOp::And => as_bool(l)? && as_bool(r)?,
            BinaryOp::Or => as_bool(l)? || as_bool(r)?,
            _ => unreachable!(),
        }));
    }
    if op == BinaryOp::Eq || op == BinaryOp::Ne {
        let eq = match (l, r) {
            (TypedValue::String(a), TypedValue::String(b)) => a == b,
            _ => as_f64(l).zip(as_f64(r)).map(|(a, b)| (a - b).abs() < f64::EPSILON).unwrap_or(false),
        };
        return Some(TypedValue::Bool(if op == BinaryOp::Eq { eq } else { !eq }));
    }
    let a = as_f64(l)?;
    let b = as_f64(r)?;
    if op.is_comparison() {
        return Some(TypedValue::Bool(match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!(),
        }));
    }
    Some(TypedValue::F64(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::Pow => a.powf(b),
        _ => unreachable!(),
    }))
}

fn eval_func(func: Func, args: &[f64]) -> Option<f64> {
    Some(match func {
        Func::Abs => args.first()?.abs(),
        Func::Sqrt => args.first()?.sqrt(),
        Func::Floor => args.first()?.floor(),
        Func::Ceil => args.first()?.ceil(),
        Func::Round => args.first()?.round(),
        Func::Log => args.first()?.ln(),
        Func::Log10 => args.first()?.log10(),
        Func::Exp => args.first()?.exp(),
        Func::Sin => args.first()?.sin(),
        Func::Cos => args.first()?.cos(),
        Func::Tan => args.first()?.tan(),
        Func::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Func::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Func::Pow => args.first()?.powf(*args.get(1)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> MemEngine {
        let dir = tempfile::tempdir().unwrap();
        // leak the tempdir so it outlives the engine in these tests
        MemEngine::open_or_create(Box::leak(Box::new(dir)).path()).unwrap()
    }

    #[test]
    fn index_get_delete_roundtrip() {
        let e = engine();
        assert!(!e.index_document("a", json!({"title": "hello"})).unwrap());
        let (doc, found) = e.get_document("a").unwrap();
        assert!(found);
        assert_eq!(doc.unwrap()["title"], "hello");
        assert!(e.index_document("a", json!({"title": "world"})).unwrap());
        assert!(e.delete_document("a").unwrap());
        assert!(!e.delete_document("a").unwrap());
    }

    #[test]
    fn match_all_matches_every_document() {
        let e = engine();
        e.index_document("a", json!({"x": 1})).unwrap();
        e.index_document("b", json!({"x": 2})).unwrap();
        let hits = e.search(&Query::MatchAll, None).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn range_and_term_filters_narrow_results() {
        let e = engine();
        e.index_document("a", json!({"price": 10})).unwrap();
        e.index_document("b", json!({"price": 20})).unwrap();
        let q = Query::Range { field: "price".into(), range: Range { gte: Some(json!(15)), gt: None, lte: None, lt: None } };
        let hits = e.search(&q, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn commit_then_reopen_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let e = MemEngine::open_or_create(dir.path()).unwrap();
            e.index_document("a", json!({"x": 1})).unwrap();
            e.commit().unwrap();
        }
        let e2 = MemEngine::open_or_create(dir.path()).unwrap();
        assert_eq!(e2.doc_count(), 1);
    }
}
