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

//! Shard execution plane (C8, spec §4.8): one shard owns a document
//! lifecycle (index/get/delete), a search path against its [`engine::Engine`]
//! handle, and the durable on-disk state under its shard directory.

pub mod engine;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use query_dsl::Query;
use serde_json::Value;
use wasm_udf::UdfRegistry;

use crate::distributed::member::ShardId;
use crate::document::DocumentContext;
use engine::{Engine, EngineError, MemEngine, ScoredDoc};

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("shard is closed")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Query(#[from] query_dsl::Error),

    #[error("wasm udf call failed: {0}")]
    Udf(#[from] wasm_udf::RegistryError),
}

/// Options threaded from the coordinator's request into a single shard's
/// search call.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub from: usize,
    pub size: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { from: 0, size: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ShardSearchResult {
    pub total_hits: u64,
    pub max_score: f64,
    pub hits: Vec<SearchHit>,
}

/// One shard of one index: its own directory, its own engine handle, and
/// (shared process-wide) access to the UDF registry for `wasm_udf` query
/// clauses.
pub struct Shard {
    index_name: String,
    shard_id: ShardId,
    primary: bool,
    data_dir: PathBuf,
    engine: MemEngine,
    udf_registry: Arc<UdfRegistry>,
    closed: AtomicBool,
}

impl Shard {
    pub fn open_or_create(
        data_dir: &Path,
        index_name: &str,
        shard_id: ShardId,
        primary: bool,
        udf_registry: Arc<UdfRegistry>,
    ) -> Result<Self, ShardError> {
        let engine = MemEngine::open_or_create(data_dir)?;
        Ok(Self {
            index_name: index_name.to_string(),
            shard_id,
            primary,
            data_dir: data_dir.to_path_buf(),
            engine,
            udf_registry,
            closed: AtomicBool::new(false),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn check_open(&self) -> Result<(), ShardError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShardError::Closed);
        }
        Ok(())
    }

    /// Returns `true` if this overwrote an existing document (so the REST
    /// layer can answer 200 vs 201).
    pub fn index_document(&self, id: &str, doc: Value) -> Result<bool, ShardError> {
        self.check_open()?;
        Ok(self.engine.index_document(id, doc)?)
    }

    pub fn get_document(&self, id: &str) -> Result<(Option<Value>, bool), ShardError> {
        self.check_open()?;
        Ok(self.engine.get_document(id)?)
    }

    pub fn delete_document(&self, id: &str) -> Result<bool, ShardError> {
        self.check_open()?;
        Ok(self.engine.delete_document(id)?)
    }

    /// Runs `query` against this shard's documents. A `wasm_udf` clause (or
    /// a bool query whose filter set is wholly a udf clause) is resolved by
    /// first asking the engine for every candidate, then post-filtering
    /// through the registry — the engine itself has no notion of UDFs.
    pub fn search(&self, query: &Query, options: &SearchOptions) -> Result<ShardSearchResult, ShardError> {
        self.check_open()?;
        let query = query_dsl::simplify(query.clone());
        let mut hits = if contains_wasm_udf(&query) {
            self.search_with_udf_post_filter(&query)?
        } else {
            self.engine.search(&query, None)?
        };

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        let total_hits = hits.len() as u64;
        let max_score = hits.first().map(|h| h.score).unwrap_or(0.0);
        let page = hits
            .into_iter()
            .skip(options.from)
            .take(options.size)
            .map(|h| SearchHit { id: h.id, score: h.score, source: h.source })
            .collect();
        Ok(ShardSearchResult { total_hits, max_score, hits: page })
    }

    fn search_with_udf_post_filter(&self, query: &Query) -> Result<Vec<ScoredDoc>, ShardError> {
        let candidates = self.engine.search(&Query::MatchAll, None)?;
        let mut kept = Vec::new();
        for candidate in candidates {
            let ctx = Arc::new(DocumentContext::new(candidate.id.clone(), candidate.source.clone(), candidate.score));
            if self.matches_with_udf(query, &ctx)? {
                kept.push(candidate);
            }
        }
        Ok(kept)
    }

    /// Evaluates `query` against one document, dispatching `wasm_udf`
    /// clauses through the registry and everything else through the
    /// engine's own single-document evaluation (by restricting the
    /// candidate set to just this one id).
    fn matches_with_udf(&self, query: &Query, ctx: &Arc<DocumentContext>) -> Result<bool, ShardError> {
        match query {
            Query::WasmUdf(udf) => {
                let version = udf.version.clone().unwrap_or_else(|| {
                    self.udf_registry.get_latest(&udf.name).map(|m| m.version).unwrap_or_default()
                });
                let params: std::collections::HashMap<String, Value> =
                    udf.parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                // A trap (or any other registry failure) on one document degrades
                // to keeping that document in the unfiltered candidate set (§7/§9)
                // rather than failing the whole search.
                match self.udf_registry.call(&udf.name, &version, ctx.clone(), params) {
                    Ok(results) => Ok(matches!(results.first(), Some(query_expr::TypedValue::Bool(true)))),
                    Err(e) => {
                        tracing::warn!(error = %e, udf = %udf.name, doc = %ctx.id(), "udf post-filter call failed, keeping document unfiltered");
                        Ok(true)
                    }
                }
            }
            Query::Bool(b) => {
                for m in &b.must_not {
                    if self.matches_with_udf(m, ctx)? {
                        return Ok(false);
                    }
                }
                for f in &b.filter {
                    if !self.matches_with_udf(f, ctx)? {
                        return Ok(false);
                    }
                }
                for m in &b.must {
                    if !self.matches_with_udf(m, ctx)? {
                        return Ok(false);
                    }
                }
                if b.should.is_empty() {
                    return Ok(true);
                }
                let mut matched = 0;
                for s in &b.should {
                    if self.matches_with_udf(s, ctx)? {
                        matched += 1;
                    }
                }
                let required = b.minimum_should_match.unwrap_or(if b.must.is_empty() && b.filter.is_empty() { 1 } else { 0 });
                Ok(matched as i64 >= required)
            }
            other => {
                let id = ctx.id().to_string();
                let hits = self.engine.search(other, Some(std::slice::from_ref(&id)))?;
                Ok(!hits.is_empty())
            }
        }
    }

    pub fn refresh(&self) -> Result<(), ShardError> {
        self.check_open()?;
        Ok(self.engine.refresh()?)
    }

    pub fn commit(&self) -> Result<(), ShardError> {
        self.check_open()?;
        Ok(self.engine.commit()?)
    }

    pub fn doc_count(&self) -> Result<usize, ShardError> {
        self.check_open()?;
        Ok(self.engine.doc_count())
    }

    pub fn close(&self) -> Result<(), ShardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        Ok(self.engine.close()?)
    }
}

fn contains_wasm_udf(query: &Query) -> bool {
    match query {
        Query::WasmUdf(_) => true,
        Query::Bool(b) => {
            b.must.iter().any(contains_wasm_udf)
                || b.should.iter().any(contains_wasm_udf)
                || b.must_not.iter().any(contains_wasm_udf)
                || b.filter.iter().any(contains_wasm_udf)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use wasm_udf::{RuntimeConfig, UdfRegistry, WasmRuntime};

    fn registry() -> Arc<UdfRegistry> {
        let runtime = WasmRuntime::new(RuntimeConfig::default()).unwrap();
        Arc::new(UdfRegistry::new(Arc::new(runtime)))
    }

    fn shard() -> Shard {
        let dir = tempfile::tempdir().unwrap();
        Shard::open_or_create(Box::leak(Box::new(dir)).path(), "products", ShardId::new(0), true, registry()).unwrap()
    }

    #[test]
    fn index_and_retrieve_document() {
        let s = shard();
        assert!(!s.index_document("1", json!({"title": "widget"})).unwrap());
        let (doc, found) = s.get_document("1").unwrap();
        assert!(found);
        assert_eq!(doc.unwrap()["title"], "widget");
    }

    #[test]
    fn search_paginates_and_sorts_by_score_then_id() {
        let s = shard();
        for i in 0..5 {
            s.index_document(&format!("{i}"), json!({"price": i})).unwrap();
        }
        let result = s.search(&Query::MatchAll, &SearchOptions { from: 0, size: 2 }).unwrap();
        assert_eq!(result.total_hits, 5);
        assert_eq!(result.hits.len(), 2);
    }

    #[test]
    fn closed_shard_rejects_operations() {
        let s = shard();
        s.close().unwrap();
        assert!(matches!(s.get_document("1"), Err(ShardError::Closed)));
    }

    #[test]
    fn commit_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = Shard::open_or_create(dir.path(), "products", ShardId::new(0), true, registry()).unwrap();
            s.index_document("1", json!({"title": "widget"})).unwrap();
            s.commit().unwrap();
        }
        let s2 = Shard::open_or_create(dir.path(), "products", ShardId::new(0), true, registry()).unwrap();
        assert_eq!(s2.doc_count().unwrap(), 1);
    }
}
