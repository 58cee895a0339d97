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

//! **[AMBIENT]** Typed, serde-deserializable configuration loaded from TOML
//! by the CLI (spec SPEC_FULL §1). Parsing crawler/indexing/webgraph config
//! is out of scope and was dropped with those subsystems; this module only
//! carries what the shard server and the coordinator API need to start.

pub mod defaults;

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::distributed::cluster::ClusterAssignment;
use crate::distributed::member::ShardId;

/// One `index -> [shard assignment]` table entry as it appears in a
/// coordinator's TOML config, before being turned into
/// [`crate::distributed::cluster::ClusterAssignment`]s.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShardAssignmentConfig {
    pub index: String,
    pub shard_id: u64,
    pub replicas: Vec<SocketAddr>,
}

impl From<ShardAssignmentConfig> for ClusterAssignment {
    fn from(c: ShardAssignmentConfig) -> Self {
        ClusterAssignment { index: c.index, shard_id: ShardId::new(c.shard_id), replicas: c.replicas }
    }
}

/// Config for the REST entrypoint (`entrypoint::api::run`). The cluster's
/// shard table is static for this implementation (spec §9 Open Question /
/// `StaticClusterMetadata`) — a deployment using a real gossip/Raft store
/// would load that boundary differently without touching this struct's
/// other fields.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiConfig {
    pub host: SocketAddr,

    pub shard_assignments: Vec<ShardAssignmentConfig>,

    #[serde(default = "defaults::coordinator::deadline_ms")]
    pub request_deadline_ms: u64,

    #[serde(default = "defaults::api::max_result_window")]
    pub max_result_window: usize,

    #[serde(default = "defaults::coordinator::connect_timeout_ms")]
    pub rpc_connect_timeout_ms: u64,
}

/// Config for the shard-hosting entrypoint (`entrypoint::shard_server::run`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShardServerConfig {
    pub host: SocketAddr,

    pub data_dir: PathBuf,

    #[serde(default = "defaults::shard_manager::total_shards")]
    pub total_shards: u64,

    #[serde(default)]
    pub wasm_runtime: WasmRuntimeConfig,
}

/// Config for the sandboxed UDF runtime each shard server hosts (spec
/// SPEC_FULL §4.0/§4.5). `mode` mirrors `wasm_udf::CompileMode`; kept as a
/// plain string here so the config crate boundary doesn't need to depend
/// on `wasm_udf`'s internal enum representation surviving unchanged.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WasmRuntimeConfig {
    #[serde(default = "default_wasm_mode")]
    pub mode: WasmCompileMode,

    #[serde(default = "defaults::wasm_runtime::max_memory_pages")]
    pub max_memory_pages: u32,

    #[serde(default = "defaults::wasm_runtime::call_deadline_epochs")]
    pub call_deadline_epochs: u64,

    #[serde(default = "defaults::wasm_runtime::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    #[serde(default = "defaults::wasm_runtime::udf_pool_size")]
    pub udf_pool_size: usize,
}

impl Default for WasmRuntimeConfig {
    fn default() -> Self {
        Self {
            mode: default_wasm_mode(),
            max_memory_pages: defaults::wasm_runtime::max_memory_pages(),
            call_deadline_epochs: defaults::wasm_runtime::call_deadline_epochs(),
            epoch_tick_ms: defaults::wasm_runtime::epoch_tick_ms(),
            udf_pool_size: defaults::wasm_runtime::udf_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WasmCompileMode {
    Jit,
    Interpreter,
}

fn default_wasm_mode() -> WasmCompileMode {
    WasmCompileMode::Jit
}

impl From<WasmCompileMode> for wasm_udf::CompileMode {
    fn from(m: WasmCompileMode) -> Self {
        match m {
            WasmCompileMode::Jit => wasm_udf::CompileMode::Jit,
            WasmCompileMode::Interpreter => wasm_udf::CompileMode::Interpreter,
        }
    }
}

impl WasmRuntimeConfig {
    pub fn to_runtime_config(&self) -> wasm_udf::RuntimeConfig {
        wasm_udf::RuntimeConfig {
            mode: self.mode.into(),
            max_memory_pages: self.max_memory_pages,
            call_deadline_epochs: self.call_deadline_epochs,
        }
    }
}

/// Parses a TOML config file at `path` into `T`, matching the teacher's
/// `load_toml_config` convention used by every entrypoint's `main.rs`
/// dispatch arm.
pub fn load_toml_config<T: serde::de::DeserializeOwned>(path: &str) -> crate::Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("failed to read config file {path:?}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("failed to parse config file {path:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_config_parses_from_toml_with_defaults() {
        let toml = r#"
            host = "127.0.0.1:8080"

            [[shard_assignments]]
            index = "products"
            shard_id = 0
            replicas = ["127.0.0.1:9000"]
        "#;
        let config: ApiConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.shard_assignments.len(), 1);
        assert_eq!(config.request_deadline_ms, defaults::coordinator::deadline_ms());
        assert_eq!(config.max_result_window, defaults::api::max_result_window());
    }

    #[test]
    fn shard_server_config_parses_from_toml_with_defaults() {
        let toml = r#"
            host = "127.0.0.1:9000"
            data_dir = "/tmp/stract-data"
        "#;
        let config: ShardServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.total_shards, defaults::shard_manager::total_shards());
        assert_eq!(config.wasm_runtime.mode, WasmCompileMode::Jit);
    }
}
