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

//! Main library for Stract: the shard execution plane, the scatter-gather
//! coordinator, and the REST surface that fronts both. The query DSL (C1-C3)
//! and the sandboxed UDF runtime (C5-C7) live in their own crates
//! (`query_expr`, `query_dsl`, `wasm_udf`) and are re-exported where this
//! crate wires them into a running shard or coordinator.

#![doc(html_logo_url = "https://stract.com/images/biglogo.svg")]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

use thiserror::Error;

pub mod api;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod document;
pub mod entrypoint;
pub mod shard;
pub mod shard_manager;

/// Request/response-facing error taxonomy (spec §7). Internal modules use
/// their own narrower `thiserror` enums (`ShardError`, `EngineError`, …);
/// this is the shape the REST layer maps everything down to.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("udf {0:?} not found")]
    UdfNotFound(String),

    #[error("required parameter {0:?} missing")]
    RequiredParamMissing(String),

    #[error("unknown parameter {0:?}")]
    UnknownParam(String),

    #[error("parameter {0:?} has the wrong type")]
    ParamTypeMismatch(String),

    #[error("sandbox trap: {reason}")]
    SandboxTrap { reason: String },

    #[error("shard {shard_id} of index {index:?} failed: {cause}")]
    ShardFailure { index: String, shard_id: u64, cause: String },

    #[error("shard {shard_id} of index {index:?} is unrecoverable: {cause}")]
    UnrecoverableShard { index: String, shard_id: u64, cause: String },

    #[error("search timed out before any shard responded")]
    TimeoutError,

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Either a single request or a batch, sent as one frame over the wire so
/// `sonic::service::Connection::batch_send_with_timeout` doesn't pay one
/// round trip per item.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn one(self) -> Option<T> {
        match self {
            OneOrMany::One(v) => Some(v),
            OneOrMany::Many(_) => None,
        }
    }

    pub fn many(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Binds a listener to an OS-assigned port, reads back its address, and
/// drops it — good enough to hand a free-but-likely-still-free port to a
/// test server started immediately after.
#[cfg(test)]
pub fn free_socket_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
