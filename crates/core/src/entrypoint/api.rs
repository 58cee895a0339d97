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

//! The REST entrypoint: builds a [`Coordinator`] over a
//! [`StaticClusterMetadata`] loaded from `config`, then serves `api::router`
//! on the configured host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::ApiConfig;
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::distributed::cluster::{ClusterAssignment, StaticClusterMetadata};

pub async fn run(config: ApiConfig) -> Result<()> {
    let assignments: Vec<ClusterAssignment> = config.shard_assignments.iter().cloned().map(Into::into).collect();
    let cluster = StaticClusterMetadata::new(assignments);

    let coordinator_config = CoordinatorConfig {
        default_deadline: Duration::from_millis(config.request_deadline_ms),
        max_result_window: config.max_result_window,
        rpc_connect_timeout: Duration::from_millis(config.rpc_connect_timeout_ms),
    };
    let coordinator = Arc::new(Coordinator::new(cluster, coordinator_config));

    let app = crate::api::router(coordinator);

    let addr = config.host;
    tracing::info!("api server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
