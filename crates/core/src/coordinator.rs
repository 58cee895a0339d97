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

//! Scatter-gather coordinator (C10, spec §4.10), built directly on the
//! sonic RPC layer `entrypoint::shard_server::ShardService` exposes: a
//! fresh `sonic::service::Connection<ShardService>` per request, fanned
//! out with `FuturesUnordered`, bounded by a per-request deadline. A
//! failing or slow shard is recorded and skipped; it never aborts the
//! whole response (spec §7/§8 "coordinator error isolation").

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;

use crate::distributed::cluster::{ClusterAssignment, ClusterMetadata};
use crate::distributed::member::ShardId;
use crate::distributed::sonic;
use crate::entrypoint::shard_server::{Commit, DeleteDocument, GetDocument, IndexDocument, Open, Refresh, Search, ShardService};
use crate::shard::SearchHit;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("index {0:?} not found")]
    UnknownIndex(String),

    #[error("search timed out before any shard responded")]
    Timeout,

    #[error("rpc to {addr} failed: {cause}")]
    Rpc { addr: SocketAddr, cause: String },
}

/// A single shard's contribution failing in a way that does not abort the
/// rest of the response (spec §3 `ShardFailure`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShardFailure {
    pub index: String,
    pub shard_id: u64,
    pub cause: String,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorSearchResult {
    pub took: Duration,
    pub timed_out: bool,
    pub shards_total: usize,
    pub shards_successful: usize,
    pub failures: Vec<ShardFailure>,
    pub total_hits: u64,
    pub max_score: f64,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub default_deadline: Duration,
    pub max_result_window: usize,
    pub rpc_connect_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_millis(crate::config::defaults::coordinator::deadline_ms()),
            max_result_window: crate::config::defaults::coordinator::max_result_window(),
            rpc_connect_timeout: Duration::from_millis(crate::config::defaults::coordinator::connect_timeout_ms()),
        }
    }
}

/// Fans queries and writes out to every shard server hosting an index,
/// using `cluster` to learn where each shard's replicas live.
pub struct Coordinator<M: ClusterMetadata> {
    cluster: M,
    config: CoordinatorConfig,
}

impl<M: ClusterMetadata> Coordinator<M> {
    pub fn new(cluster: M, config: CoordinatorConfig) -> Self {
        Self { cluster, config }
    }

    pub fn indices(&self) -> Vec<String> {
        self.cluster.indices()
    }

    fn assignments_or_err(&self, index: &str) -> Result<Vec<ClusterAssignment>, Error> {
        let assignments = self.cluster.shards_for(index);
        if assignments.is_empty() {
            return Err(Error::UnknownIndex(index.to_string()));
        }
        Ok(assignments)
    }

    fn route(&self, index: &str, doc_id: &str) -> Result<ClusterAssignment, Error> {
        let assignments = self.assignments_or_err(index)?;
        let shard_id = ShardId::new(common::shard_for(doc_id, assignments.len() as u64));
        assignments
            .into_iter()
            .find(|a| a.shard_id == shard_id)
            .ok_or_else(|| Error::UnknownIndex(index.to_string()))
    }

    /// Opens shard `shard_id` of `index` on every one of its configured
    /// replica addresses. Called once per shard when an index is created
    /// (`PUT /{index}`); a node otherwise only opens the shards it finds
    /// already on disk at startup.
    pub async fn create_index(&self, index: &str) -> Result<Vec<ShardFailure>, Error> {
        let assignments = self.assignments_or_err(index)?;
        let mut tasks = FuturesUnordered::new();
        for assignment in &assignments {
            let primary_addr = assignment.primary();
            for addr in assignment.replicas.clone() {
                let index = index.to_string();
                let shard_id = assignment.shard_id;
                let primary = Some(addr) == primary_addr;
                let connect_timeout = self.config.rpc_connect_timeout;
                tasks.push(async move {
                    let res = open_shard(addr, &index, shard_id, primary, connect_timeout).await;
                    (index, shard_id, addr, res)
                });
            }
        }

        let mut failures = Vec::new();
        while let Some((index, shard_id, addr, res)) = tasks.next().await {
            if let Err(e) = res {
                failures.push(ShardFailure { index, shard_id: shard_id.as_u64(), cause: format!("{addr}: {e}") });
            }
        }
        Ok(failures)
    }

    /// Routes a document to the shard that owns it (spec §4.9 `shard_for`)
    /// and indexes it on that shard's primary. Returns whether this
    /// overwrote an existing document.
    pub async fn index_document(&self, index: &str, doc_id: &str, body: Value) -> Result<bool, Error> {
        let assignment = self.route(index, doc_id)?;
        let addr = assignment.primary().ok_or_else(|| Error::UnknownIndex(index.to_string()))?;
        let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, self.config.rpc_connect_timeout)
            .await
            .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?;
        conn.send_with_timeout(
            &IndexDocument {
                index: index.to_string(),
                shard_id: assignment.shard_id.as_u64(),
                id: doc_id.to_string(),
                body_json: body.to_string(),
            },
            self.config.default_deadline,
        )
        .await
        .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?
        .map_err(|cause| Error::Rpc { addr, cause })
    }

    pub async fn get_document(&self, index: &str, doc_id: &str) -> Result<Option<Value>, Error> {
        let assignment = self.route(index, doc_id)?;
        let addr = assignment.primary().ok_or_else(|| Error::UnknownIndex(index.to_string()))?;
        let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, self.config.rpc_connect_timeout)
            .await
            .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?;
        let raw = conn
            .send_with_timeout(
                &GetDocument { index: index.to_string(), shard_id: assignment.shard_id.as_u64(), id: doc_id.to_string() },
                self.config.default_deadline,
            )
            .await
            .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?
            .map_err(|cause| Error::Rpc { addr, cause })?;
        Ok(raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::Null)))
    }

    pub async fn delete_document(&self, index: &str, doc_id: &str) -> Result<bool, Error> {
        let assignment = self.route(index, doc_id)?;
        let addr = assignment.primary().ok_or_else(|| Error::UnknownIndex(index.to_string()))?;
        let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, self.config.rpc_connect_timeout)
            .await
            .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?;
        conn.send_with_timeout(
            &DeleteDocument { index: index.to_string(), shard_id: assignment.shard_id.as_u64(), id: doc_id.to_string() },
            self.config.default_deadline,
        )
        .await
        .map_err(|e| Error::Rpc { addr, cause: e.to_string() })?
        .map_err(|cause| Error::Rpc { addr, cause })
    }

    /// Refreshes every shard of `index` in parallel, isolating per-shard
    /// failures rather than failing the whole call.
    pub async fn refresh(&self, index: &str) -> Result<Vec<ShardFailure>, Error> {
        self.fan_out_primaries(index, |addr, idx, shard_id| async move {
            let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, Duration::from_secs(5))
                .await
                .map_err(|e| e.to_string())?;
            conn.send_with_timeout(&Refresh { index: idx, shard_id: shard_id.as_u64() }, Duration::from_secs(30))
                .await
                .map_err(|e| e.to_string())?
        })
        .await
    }

    /// Commits every shard of `index` in parallel, isolating per-shard
    /// failures rather than failing the whole call.
    pub async fn commit(&self, index: &str) -> Result<Vec<ShardFailure>, Error> {
        self.fan_out_primaries(index, |addr, idx, shard_id| async move {
            let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, Duration::from_secs(5))
                .await
                .map_err(|e| e.to_string())?;
            conn.send_with_timeout(&Commit { index: idx, shard_id: shard_id.as_u64() }, Duration::from_secs(30))
                .await
                .map_err(|e| e.to_string())?
        })
        .await
    }

    async fn fan_out_primaries<F, Fut>(&self, index: &str, f: F) -> Result<Vec<ShardFailure>, Error>
    where
        F: Fn(SocketAddr, String, ShardId) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let assignments = self.assignments_or_err(index)?;
        let mut tasks = FuturesUnordered::new();
        for assignment in assignments {
            let Some(addr) = assignment.primary() else { continue };
            let shard_id = assignment.shard_id;
            let index = index.to_string();
            let fut = f(addr, index.clone(), shard_id);
            tasks.push(async move { (index, shard_id, addr, fut.await) });
        }

        let mut failures = Vec::new();
        while let Some((index, shard_id, addr, res)) = tasks.next().await {
            if let Err(cause) = res {
                failures.push(ShardFailure { index, shard_id: shard_id.as_u64(), cause: format!("{addr}: {cause}") });
            }
        }
        Ok(failures)
    }

    /// Scatter-gather search (spec §4.10): one `Search` RPC per shard,
    /// fanned out with `FuturesUnordered`, merged by score then `(shard_id,
    /// id)`. `query_json` is forwarded to every shard unparsed — the
    /// coordinator doesn't need to understand the query tree, only where
    /// to send it; each shard parses it locally via `query_dsl::parse`.
    pub async fn search(
        &self,
        index: &str,
        query_json: &Value,
        from: usize,
        size: usize,
        deadline: Option<Duration>,
    ) -> Result<CoordinatorSearchResult, Error> {
        let start = Instant::now();
        let assignments = self.assignments_or_err(index)?;
        let deadline = deadline.unwrap_or(self.config.default_deadline);
        let size = size.min(self.config.max_result_window);
        let shards_total = assignments.len();
        // Every shard is asked for its best `from + size` so the coordinator
        // can re-sort the union and still slice out `[from, from+size)`
        // (spec §8 "pagination disjointness").
        let per_shard_size = (from + size) as u64;
        let query_json_str = query_json.to_string();

        let mut tasks = FuturesUnordered::new();
        for assignment in &assignments {
            let Some(addr) = assignment.primary() else { continue };
            let index_name = index.to_string();
            let shard_id = assignment.shard_id;
            let query_json_str = query_json_str.clone();
            tasks.push(async move {
                let res = search_shard(addr, &index_name, shard_id, query_json_str, per_shard_size, deadline).await;
                (index_name, shard_id, addr, res)
            });
        }

        let mut failures = Vec::new();
        let mut by_shard_hits: Vec<(ShardId, SearchHit)> = Vec::new();
        let mut successful = 0usize;
        let mut total_hits = 0u64;

        let gather = async {
            while let Some((index, shard_id, addr, res)) = tasks.next().await {
                match res {
                    Ok(result) => {
                        successful += 1;
                        total_hits += result.total_hits;
                        for h in result.hits {
                            let source: Value = serde_json::from_str(&h.source_json).unwrap_or(Value::Null);
                            by_shard_hits.push((shard_id, SearchHit { id: h.id, score: h.score, source }));
                        }
                    }
                    Err(cause) => failures.push(ShardFailure { index, shard_id: shard_id.as_u64(), cause: format!("{addr}: {cause}") }),
                }
            }
        };

        let timed_out = tokio::time::timeout(deadline, gather).await.is_err();
        if successful == 0 && failures.is_empty() {
            return Err(Error::Timeout);
        }

        by_shard_hits.sort_by(|(sa, a), (sb, b)| b.score.total_cmp(&a.score).then_with(|| (sa, &a.id).cmp(&(sb, &b.id))));
        let max_score = by_shard_hits.first().map(|(_, h)| h.score).unwrap_or(0.0);
        let hits = by_shard_hits.into_iter().skip(from).take(size).map(|(_, h)| h).collect();

        Ok(CoordinatorSearchResult {
            took: start.elapsed(),
            timed_out,
            shards_total,
            shards_successful: successful,
            failures,
            total_hits,
            max_score,
            hits,
        })
    }
}

async fn open_shard(addr: SocketAddr, index: &str, shard_id: ShardId, primary: bool, connect_timeout: Duration) -> Result<(), String> {
    let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, connect_timeout).await.map_err(|e| e.to_string())?;
    conn.send_with_timeout(&Open { index: index.to_string(), shard_id: shard_id.as_u64(), primary }, Duration::from_secs(30))
        .await
        .map_err(|e| e.to_string())?
}

async fn search_shard(
    addr: SocketAddr,
    index: &str,
    shard_id: ShardId,
    query_json: String,
    size: u64,
    deadline: Duration,
) -> Result<crate::entrypoint::shard_server::WireSearchResult, String> {
    let conn = sonic::service::Connection::<ShardService>::create_with_timeout(addr, deadline).await.map_err(|e| e.to_string())?;
    conn.send_with_timeout(&Search { index: index.to_string(), shard_id: shard_id.as_u64(), query_json, from: 0, size }, deadline)
        .await
        .map_err(|e| e.to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::cluster::StaticClusterMetadata;

    fn empty_cluster() -> Coordinator<StaticClusterMetadata> {
        Coordinator::new(StaticClusterMetadata::new(vec![]), CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn unknown_index_is_rejected_before_any_rpc() {
        let c = empty_cluster();
        assert!(matches!(c.index_document("nope", "1", serde_json::json!({})).await, Err(Error::UnknownIndex(_))));
        assert!(matches!(c.search("nope", &serde_json::json!({"match_all": {}}), 0, 10, None).await, Err(Error::UnknownIndex(_))));
    }

    #[tokio::test]
    async fn indices_lists_every_configured_index() {
        let meta = StaticClusterMetadata::new(vec![ClusterAssignment {
            index: "products".into(),
            shard_id: ShardId::new(0),
            replicas: vec!["127.0.0.1:9000".parse().unwrap()],
        }]);
        let c = Coordinator::new(meta, CoordinatorConfig::default());
        assert_eq!(c.indices(), vec!["products".to_string()]);
    }

    /// Stands up a single real shard behind the `sonic` RPC layer and a
    /// `Coordinator` pointed at it, matching the fixture shape
    /// `distributed::sonic::service` tests use for spinning up a live server.
    async fn one_shard_coordinator(index: &str) -> Coordinator<StaticClusterMetadata> {
        let dir = tempfile::tempdir().unwrap();
        let wasm_runtime = std::sync::Arc::new(wasm_udf::WasmRuntime::new(wasm_udf::RuntimeConfig::default()).unwrap());
        let udf_registry = std::sync::Arc::new(wasm_udf::UdfRegistry::new(wasm_runtime));
        let shards = std::sync::Arc::new(crate::shard_manager::ShardManager::new(
            Box::leak(Box::new(dir)).path().to_path_buf(),
            1,
            udf_registry,
        ));

        let addr = crate::free_socket_addr();
        let server = crate::entrypoint::shard_server::ShardService::new(shards).bind(addr).await.unwrap();
        tokio::spawn(async move {
            loop {
                let _ = server.accept().await;
            }
        });

        let meta = StaticClusterMetadata::new(vec![ClusterAssignment { index: index.to_string(), shard_id: ShardId::new(0), replicas: vec![addr] }]);
        let coordinator = Coordinator::new(meta, CoordinatorConfig::default());
        coordinator.create_index(index).await.unwrap();
        coordinator
    }

    /// Regression test for the merge step reporting `total_hits` as the
    /// number of rows it happened to keep after pagination instead of the
    /// sum of every shard's match count (spec §4.10 step 5).
    #[tokio::test]
    async fn total_hits_counts_all_matches_not_just_the_returned_page() {
        let c = one_shard_coordinator("products").await;
        for i in 0..25 {
            c.index_document("products", &i.to_string(), serde_json::json!({"price": i})).await.unwrap();
        }
        c.refresh("products").await.unwrap();

        let result = c.search("products", &serde_json::json!({"match_all": {}}), 0, 10, None).await.unwrap();
        assert_eq!(result.total_hits, 25);
        assert_eq!(result.hits.len(), 10);
    }

    /// `_count` (api.rs) asks for `size = 0` so it never pays for hit
    /// bodies; it depends entirely on `total_hits` being the full match
    /// count rather than the length of an empty page.
    #[tokio::test]
    async fn zero_size_search_still_reports_full_total_hits() {
        let c = one_shard_coordinator("products").await;
        for i in 0..5 {
            c.index_document("products", &i.to_string(), serde_json::json!({"price": i})).await.unwrap();
        }
        c.refresh("products").await.unwrap();

        let result = c.search("products", &serde_json::json!({"match_all": {}}), 0, 0, None).await.unwrap();
        assert_eq!(result.total_hits, 5);
        assert!(result.hits.is_empty());
    }
}
