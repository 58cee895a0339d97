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

use anyhow::Result;
use clap::{Parser, Subcommand};
use stract::config;
use stract::entrypoint::{api, shard_server};
use stract::shard_manager::ShardManager;
use tracing_subscriber::prelude::*;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[clap(name = "stract-search", version)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator's REST entrypoint.
    Api { config_path: String },

    /// Run a node that hosts shards behind a coordinator.
    ShardServer { config_path: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder().with_default_directive("stract=info".parse().unwrap()).from_env_lossy(),
        )
        .without_time()
        .with_target(false)
        .finish()
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    match args.command {
        Commands::Api { config_path } => {
            let cfg: config::ApiConfig = config::load_toml_config(&config_path)?;
            rt.block_on(api::run(cfg))?;
        }
        Commands::ShardServer { config_path } => {
            let cfg: config::ShardServerConfig = config::load_toml_config(&config_path)?;
            let runtime_config = cfg.wasm_runtime.to_runtime_config();
            let wasm_runtime = std::sync::Arc::new(wasm_udf::WasmRuntime::new(runtime_config)?);
            let udf_registry = std::sync::Arc::new(wasm_udf::UdfRegistry::new(wasm_runtime));
            let shards = std::sync::Arc::new(ShardManager::new(cfg.data_dir.clone(), cfg.total_shards, udf_registry));
            rt.block_on(shard_server::run(cfg, shards))?;
        }
    }

    Ok(())
}
