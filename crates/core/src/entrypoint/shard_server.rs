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

//! The sonic RPC surface a shard-hosting node exposes to coordinators:
//! one [`ShardService`] wrapping this node's [`ShardManager`], modeled
//! directly on the request/response shape `search_server` uses elsewhere
//! in this crate.

use std::sync::Arc;

use tracing::info;

use crate::distributed::member::ShardId;
use crate::distributed::sonic;
use crate::distributed::sonic::service::sonic_service;
use crate::shard::SearchOptions;
use crate::shard_manager::ShardManager;
use crate::{config::ShardServerConfig, Result};

sonic_service!(ShardService, [Open, IndexDocument, GetDocument, DeleteDocument, Search, Refresh, Commit]);

pub struct ShardService {
    shards: Arc<ShardManager>,
}

impl ShardService {
    pub fn new(shards: Arc<ShardManager>) -> Self {
        Self { shards }
    }
}

/// Opens (creating if absent) the shard `(index, shard_id)` on this node.
/// The coordinator issues this to every replica address of a newly created
/// index, since a node only otherwise opens shards it finds on disk at
/// startup (`ShardManager::recover`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct Open {
    pub index: String,
    pub shard_id: u64,
    pub primary: bool,
}
impl sonic::service::Message<ShardService> for Open {
    type Response = Result<(), String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        server.shards.open(&self.index, ShardId::new(self.shard_id), self.primary).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct IndexDocument {
    pub index: String,
    pub shard_id: u64,
    pub id: String,
    pub body_json: String,
}
impl sonic::service::Message<ShardService> for IndexDocument {
    type Response = Result<bool, String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        let body: serde_json::Value = serde_json::from_str(&self.body_json).map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || shard.index_document(&self.id, body).map_err(|e| e.to_string()))
            .await
            .map_err(|e| e.to_string())?
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetDocument {
    pub index: String,
    pub shard_id: u64,
    pub id: String,
}
impl sonic::service::Message<ShardService> for GetDocument {
    type Response = Result<Option<String>, String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || {
            let (doc, _found) = shard.get_document(&self.id).map_err(|e| e.to_string())?;
            Ok(doc.map(|v| v.to_string()))
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct DeleteDocument {
    pub index: String,
    pub shard_id: u64,
    pub id: String,
}
impl sonic::service::Message<ShardService> for DeleteDocument {
    type Response = Result<bool, String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || shard.delete_document(&self.id).map_err(|e| e.to_string())).await.map_err(|e| e.to_string())?
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct WireSearchHit {
    pub id: String,
    pub score: f64,
    pub source_json: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct WireSearchResult {
    pub total_hits: u64,
    pub max_score: f64,
    pub hits: Vec<WireSearchHit>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct Search {
    pub index: String,
    pub shard_id: u64,
    pub query_json: String,
    pub from: u64,
    pub size: u64,
}
impl sonic::service::Message<ShardService> for Search {
    type Response = Result<WireSearchResult, String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        let query_value: serde_json::Value = serde_json::from_str(&self.query_json).map_err(|e| e.to_string())?;
        let query = query_dsl::parse(&query_value).map_err(|e| e.to_string())?;
        let options = SearchOptions { from: self.from as usize, size: self.size as usize };
        tokio::task::spawn_blocking(move || {
            let result = shard.search(&query, &options).map_err(|e| e.to_string())?;
            Ok(WireSearchResult {
                total_hits: result.total_hits,
                max_score: result.max_score,
                hits: result.hits.into_iter().map(|h| WireSearchHit { id: h.id, score: h.score, source_json: h.source.to_string() }).collect(),
            })
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct Refresh {
    pub index: String,
    pub shard_id: u64,
}
impl sonic::service::Message<ShardService> for Refresh {
    type Response = Result<(), String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || shard.refresh().map_err(|e| e.to_string())).await.map_err(|e| e.to_string())?
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct Commit {
    pub index: String,
    pub shard_id: u64,
}
impl sonic::service::Message<ShardService> for Commit {
    type Response = Result<(), String>;
    async fn handle(self, server: &ShardService) -> Self::Response {
        let shard = server.shards.get_or_err(&self.index, ShardId::new(self.shard_id)).map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || shard.commit().map_err(|e| e.to_string())).await.map_err(|e| e.to_string())?
    }
}

pub async fn run(config: ShardServerConfig, shards: Arc<ShardManager>) -> Result<()> {
    let addr = config.host;
    let recovered_failures = shards.recover()?;
    for (index, shard_id, cause) in &recovered_failures {
        tracing::error!(%index, shard_id = shard_id.as_u64(), %cause, "shard failed to recover at startup");
    }

    let server = ShardService::new(shards).bind(addr).await?;
    info!("shard server is ready to accept requests on {}", addr);

    loop {
        if let Err(e) = server.accept().await {
            tracing::error!("{:?}", e);
        }
    }
}
