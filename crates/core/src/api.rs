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

//! **[ADDED]** Thin `axum` REST surface fronting a [`Coordinator`] (spec §6).
//! Translates HTTP JSON into the coordinator's native request/response
//! types and back; every handler here is a few lines of glue, matching the
//! teacher's `api::router` shape (routing only, no business logic).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::{Coordinator, Error as CoordinatorError};
use crate::distributed::cluster::ClusterMetadata;

#[derive(Clone)]
struct AppState<M: ClusterMetadata + 'static> {
    coordinator: Arc<Coordinator<M>>,
}

pub fn router<M: ClusterMetadata + Send + Sync + 'static>(coordinator: Arc<Coordinator<M>>) -> Router {
    let state = AppState { coordinator };
    Router::new()
        .route("/_cluster/health", get(cluster_health::<M>))
        .route("/_bulk", post(bulk::<M>))
        .route("/:index", put(create_index::<M>))
        .route("/:index/_doc/:id", put(index_document::<M>))
        .route("/:index/_doc/:id", get(get_document::<M>))
        .route("/:index/_doc/:id", delete(delete_document::<M>))
        .route("/:index/_search", post(search::<M>))
        .route("/:index/_refresh", post(refresh::<M>))
        .route("/:index/_count", post(count::<M>))
        .with_state(state)
}

fn coordinator_error_response(e: CoordinatorError) -> Response {
    let status = match &e {
        CoordinatorError::UnknownIndex(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        CoordinatorError::Rpc { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

async fn create_index<M: ClusterMetadata + Send + Sync + 'static>(
    State(state): State<AppState<M>>,
    Path(index): Path<String>,
) -> Response {
    match state.coordinator.create_index(&index).await {
        Ok(failures) if failures.is_empty() => (StatusCode::OK, Json(serde_json::json!({ "acknowledged": true }))).into_response(),
        Ok(failures) => (StatusCode::OK, Json(serde_json::json!({ "acknowledged": true, "shard_failures": failures }))).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

async fn index_document<M: ClusterMetadata + Send + Sync + 'static>(
    State(state): State<AppState<M>>,
    Path((index, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    match state.coordinator.index_document(&index, &id, body).await {
        Ok(overwrote) => {
            let status = if overwrote { StatusCode::OK } else { StatusCode::CREATED };
            (status, Json(serde_json::json!({ "_index": index, "_id": id, "result": if overwrote { "updated" } else { "created" } }))).into_response()
        }
        Err(e) => coordinator_error_response(e),
    }
}

async fn get_document<M: ClusterMetadata + Send + Sync + 'static>(
    State(state): State<AppState<M>>,
    Path((index, id)): Path<(String, String)>,
) -> Response {
    match state.coordinator.get_document(&index, &id).await {
        Ok(Some(source)) => Json(serde_json::json!({ "_index": index, "_id": id, "found": true, "_source": source })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "_index": index, "_id": id, "found": false }))).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

async fn delete_document<M: ClusterMetadata + Send + Sync + 'static>(
    State(state): State<AppState<M>>,
    Path((index, id)): Path<(String, String)>,
) -> Response {
    match state.coordinator.delete_document(&index, &id).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "_index": index, "_id": id, "result": "deleted" }))).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "_index": index, "_id": id, "result": "not_found" }))).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

/// Body of `POST /{index}/_search` (spec §6). `sort` and `_source` are
/// accepted and echoed through the request's shape but the merge itself
/// always sorts by score then `(shard_id, id)` — per-field sort is not in
/// scope for this implementation (native engine doesn't expose doc
/// values), same narrowing spec.md already applies to `_source` beyond
/// "whole document or nothing".
#[derive(Debug, Deserialize)]
struct SearchRequestBody {
    query: Value,
    #[serde(default = "default_size")]
    size: usize,
    #[serde(default)]
    from: usize,
    #[serde(default)]
    sort: Option<Value>,
    #[serde(default)]
    _source: Option<Value>,
    #[serde(default)]
    timeout: Option<String>,
}

fn default_size() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SearchResponseBody {
    took: u64,
    timed_out: bool,
    _shards: ShardsSummary,
    hits: HitsSummary,
}

#[derive(Debug, Serialize)]
struct ShardsSummary {
    total: usize,
    successful: usize,
    failed: usize,
    failures: Vec<crate::coordinator::ShardFailure>,
}

#[derive(Debug, Serialize)]
struct HitsSummary {
    total: HitsTotal,
    max_score: Option<f64>,
    hits: Vec<Hit>,
}

#[derive(Debug, Serialize)]
struct HitsTotal {
    value: u64,
    relation: &'static str,
}

#[derive(Debug, Serialize)]
struct Hit {
    _index: String,
    _id: String,
    _score: f64,
    _source: Value,
}

/// Parses a duration string like `"500ms"`/`"2s"` (ES-style). Unrecognized
/// suffixes or bodies fall back to the coordinator's default deadline.
fn parse_timeout(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_millis)
}

async fn search<M: ClusterMetadata + Send + Sync + 'static>(
    State(state): State<AppState<M>>,
    Path(index): Path<String>,
    Json(body): Json<SearchRequestBody>,
) -> Response {
    if let Err(e) = query_dsl::parse(&body.query) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response();
    }

    let deadline = body.timeout.as_deref().and_then(parse_timeout);
    match state.coordinator.search(&index, &body.query, body.from, body.size, deadline).await {
        Ok(result) => {
            let body = SearchResponseBody {
                took: result.took.as_millis() as u64,
                timed_out: result.timed_out,
                _shards: ShardsSummary {
                    total: result.shards_total,
                    successful: result.shards_successful,
                    failed: result.failures.len(),
                    failures: result.failures,
                },
                hits: HitsSummary {
                    total: HitsTotal { value: result.total_hits, relation: "eq" },
                    max_score: if result.hits.is_empty() { None } else { Some(result.max_score) },
                    hits: result
                        .hits
                        .into_iter()
                        .map(|h| Hit { _index: index.clone(), _id: h.id, _score: h.score, _source: h.source })
                        .collect(),
                },
            };
            Json(body).into_response()
        }
        Err(e @ CoordinatorError::Timeout) => (StatusCode::GATEWAY_TIMEOUT, Json(serde_json::json!({ "error": e.to_string(), "timed_out": true }))).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

async fn refresh<M: ClusterMetadata + Send + Sync + 'static>(State(state): State<AppState<M>>, Path(index): Path<String>) -> Response {
    match state.coordinator.refresh(&index).await {
        Ok(failures) => Json(serde_json::json!({ "_shards": { "failed": failures.len() }, "failures": failures })).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

async fn count<M: ClusterMetadata + Send + Sync + 'static>(State(state): State<AppState<M>>, Path(index): Path<String>) -> Response {
    let match_all = serde_json::json!({ "match_all": {} });
    match state.coordinator.search(&index, &match_all, 0, 0, None).await {
        Ok(result) => Json(serde_json::json!({ "count": result.total_hits, "_shards": { "total": result.shards_total, "successful": result.shards_successful, "failed": result.failures.len() } })).into_response(),
        Err(e) => coordinator_error_response(e),
    }
}

async fn cluster_health<M: ClusterMetadata + Send + Sync + 'static>(State(state): State<AppState<M>>) -> Response {
    Json(serde_json::json!({ "status": "green", "indices": state.coordinator.indices() })).into_response()
}

/// One line of a `POST /_bulk` body: an action line (`{"index":
/// {"_index": ..., "_id": ...}}` or `{"delete": {...}}`) followed by the
/// document line for `index`/`create` actions, newline-delimited as the
/// teacher's own ingestion pipelines expect (spec §6 "newline-delimited
/// action/doc pairs").
#[derive(Debug, Deserialize)]
struct BulkActionLine {
    #[serde(rename = "index")]
    index: Option<BulkTarget>,
    #[serde(rename = "create")]
    create: Option<BulkTarget>,
    #[serde(rename = "delete")]
    delete: Option<BulkTarget>,
}

#[derive(Debug, Deserialize)]
struct BulkTarget {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
}

async fn bulk<M: ClusterMetadata + Send + Sync + 'static>(State(state): State<AppState<M>>, body: String) -> Response {
    let mut lines = body.lines();
    let mut items = Vec::new();

    while let Some(action_line) = lines.next() {
        if action_line.trim().is_empty() {
            continue;
        }
        let action: BulkActionLine = match serde_json::from_str(action_line) {
            Ok(a) => a,
            Err(e) => {
                items.push(serde_json::json!({ "error": format!("malformed action line: {e}") }));
                continue;
            }
        };

        if let Some(target) = action.index.or(action.create) {
            let Some(doc_line) = lines.next() else {
                items.push(serde_json::json!({ "error": "missing document line after index/create action" }));
                break;
            };
            let doc: Value = match serde_json::from_str(doc_line) {
                Ok(v) => v,
                Err(e) => {
                    items.push(serde_json::json!({ "error": format!("malformed document line: {e}") }));
                    continue;
                }
            };
            match state.coordinator.index_document(&target.index, &target.id, doc).await {
                Ok(overwrote) => items.push(serde_json::json!({
                    "index": { "_index": target.index, "_id": target.id, "status": if overwrote { 200 } else { 201 } }
                })),
                Err(e) => items.push(serde_json::json!({
                    "index": { "_index": target.index, "_id": target.id, "error": e.to_string() }
                })),
            }
        } else if let Some(target) = action.delete {
            match state.coordinator.delete_document(&target.index, &target.id).await {
                Ok(found) => items.push(serde_json::json!({
                    "delete": { "_index": target.index, "_id": target.id, "status": if found { 200 } else { 404 } }
                })),
                Err(e) => items.push(serde_json::json!({
                    "delete": { "_index": target.index, "_id": target.id, "error": e.to_string() }
                })),
            }
        }
    }

    let errored = items.iter().any(|i| i.get("error").is_some() || i.as_object().map_or(false, |o| o.values().any(|v| v.get("error").is_some())));
    Json(serde_json::json!({ "errors": errored, "items": items })).into_response()
}
