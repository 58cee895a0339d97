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

//! Shard manager (C9, spec §4.9): the per-node registry of `Shard`s, the
//! document-id-to-shard routing function, and startup/shutdown sweeps over
//! every shard this node is responsible for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use wasm_udf::UdfRegistry;

use crate::distributed::member::ShardId;
use crate::shard::{Shard, ShardError};

#[derive(Debug, thiserror::Error)]
pub enum ShardManagerError {
    #[error("shard {shard_id:?} of index {index:?} is not hosted on this node")]
    UnknownShard { index: String, shard_id: ShardId },

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns every [`Shard`] this node currently hosts, keyed by `(index, shard
/// id)`. Closing and opening shards is serialized through a single lock;
/// the `Shard`s themselves are internally synchronized so lookups don't
/// contend with in-flight searches on other shards.
pub struct ShardManager {
    data_dir: PathBuf,
    total_shards: u64,
    shards: RwLock<HashMap<(String, ShardId), Arc<Shard>>>,
    udf_registry: Arc<UdfRegistry>,
}

impl ShardManager {
    pub fn new(data_dir: impl Into<PathBuf>, total_shards: u64, udf_registry: Arc<UdfRegistry>) -> Self {
        Self { data_dir: data_dir.into(), total_shards: total_shards.max(1), shards: RwLock::new(HashMap::new()), udf_registry }
    }

    pub fn total_shards(&self) -> u64 {
        self.total_shards
    }

    /// Which shard a document id routes to, deterministically. Shares the
    /// hash in `common` with [`crate::coordinator`] so the two never
    /// disagree about where a document lives (spec §4.9, §9 Open Question).
    pub fn shard_for(&self, doc_id: &str) -> ShardId {
        ShardId::new(common::shard_for(doc_id, self.total_shards))
    }

    fn shard_dir(&self, index: &str, shard_id: ShardId) -> PathBuf {
        self.data_dir.join(index).join(format!("shard_{}", shard_id.as_u64()))
    }

    /// Opens (creating if absent) and registers the shard for `(index,
    /// shard_id)` on this node.
    pub fn open(&self, index: &str, shard_id: ShardId, primary: bool) -> Result<Arc<Shard>, ShardManagerError> {
        let dir = self.shard_dir(index, shard_id);
        let shard = Arc::new(Shard::open_or_create(&dir, index, shard_id, primary, self.udf_registry.clone())?);
        self.shards.write().insert((index.to_string(), shard_id), shard.clone());
        Ok(shard)
    }

    pub fn get(&self, index: &str, shard_id: ShardId) -> Option<Arc<Shard>> {
        self.shards.read().get(&(index.to_string(), shard_id)).cloned()
    }

    pub fn get_or_err(&self, index: &str, shard_id: ShardId) -> Result<Arc<Shard>, ShardManagerError> {
        self.get(index, shard_id).ok_or_else(|| ShardManagerError::UnknownShard { index: index.to_string(), shard_id })
    }

    pub fn local_shard_ids(&self, index: &str) -> Vec<ShardId> {
        self.shards.read().keys().filter(|(i, _)| i == index).map(|(_, s)| *s).collect()
    }

    /// Scans `<data_dir>/<index>/shard_<n>` directories already on disk and
    /// reopens each as a primary. A single shard failing to open is
    /// recorded and skipped rather than aborting the whole sweep.
    pub fn recover(&self) -> Result<Vec<(String, ShardId, ShardManagerError)>, ShardManagerError> {
        let mut failures = Vec::new();
        if !self.data_dir.exists() {
            return Ok(failures);
        }
        for index_entry in std::fs::read_dir(&self.data_dir)? {
            let index_entry = index_entry?;
            if !index_entry.file_type()?.is_dir() {
                continue;
            }
            let index_name = index_entry.file_name().to_string_lossy().to_string();
            for shard_entry in std::fs::read_dir(index_entry.path())? {
                let shard_entry = shard_entry?;
                let name = shard_entry.file_name().to_string_lossy().to_string();
                let Some(id_str) = name.strip_prefix("shard_") else { continue };
                let Ok(id) = id_str.parse::<u64>() else { continue };
                let shard_id = ShardId::new(id);
                if let Err(e) = self.open(&index_name, shard_id, true) {
                    failures.push((index_name.clone(), shard_id, e));
                }
            }
        }
        Ok(failures)
    }

    /// Commits and closes every hosted shard, isolating per-shard failures
    /// instead of letting one stuck shard block shutdown of the rest.
    pub fn close_all(&self) -> Vec<((String, ShardId), ShardError)> {
        let mut failures = Vec::new();
        for ((index, shard_id), shard) in self.shards.write().drain() {
            if let Err(e) = shard.commit().and_then(|_| shard.close()) {
                failures.push(((index, shard_id), e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total_shards: u64) -> ShardManager {
        let dir = tempfile::tempdir().unwrap();
        let runtime = wasm_udf::WasmRuntime::new(wasm_udf::RuntimeConfig::default()).unwrap();
        let registry = Arc::new(UdfRegistry::new(Arc::new(runtime)));
        ShardManager::new(Box::leak(Box::new(dir)).path().to_path_buf(), total_shards, registry)
    }

    #[test]
    fn shard_for_is_deterministic_and_in_range() {
        let m = manager(8);
        let a = m.shard_for("doc-123");
        let b = m.shard_for("doc-123");
        assert_eq!(a, b);
        assert!(a.as_u64() < 8);
    }

    #[test]
    fn open_then_get_returns_same_shard() {
        let m = manager(4);
        let shard = m.open("products", ShardId::new(0), true).unwrap();
        shard.index_document("1", serde_json::json!({"x": 1})).unwrap();
        let fetched = m.get("products", ShardId::new(0)).unwrap();
        assert_eq!(fetched.doc_count().unwrap(), 1);
    }

    #[test]
    fn get_or_err_reports_unknown_shard() {
        let m = manager(4);
        assert!(matches!(m.get_or_err("products", ShardId::new(0)), Err(ShardManagerError::UnknownShard { .. })));
    }

    #[test]
    fn recover_reopens_previously_committed_shards() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = wasm_udf::WasmRuntime::new(wasm_udf::RuntimeConfig::default()).unwrap();
        let registry = Arc::new(UdfRegistry::new(Arc::new(runtime)));
        {
            let m = ShardManager::new(dir.path(), 2, registry.clone());
            let shard = m.open("products", ShardId::new(0), true).unwrap();
            shard.index_document("1", serde_json::json!({"x": 1})).unwrap();
            shard.commit().unwrap();
        }
        let m2 = ShardManager::new(dir.path(), 2, registry);
        let failures = m2.recover().unwrap();
        assert!(failures.is_empty());
        let shard = m2.get("products", ShardId::new(0)).unwrap();
        assert_eq!(shard.doc_count().unwrap(), 1);
    }
}
