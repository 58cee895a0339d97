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

//! Cluster membership (C11). The coordinator only ever needs "which shard
//! servers serve this index, and which is primary" — gossip convergence,
//! failure detection, and rebalancing are a different system's job and are
//! explicitly out of scope here. [`ClusterMetadata`] is the black-box seam;
//! [`StaticClusterMetadata`] is a fixed, config-driven stand-in for it.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::distributed::member::ShardId;

/// Where one shard of one index lives: its id and every replica address
/// that serves it, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    pub index: String,
    pub shard_id: ShardId,
    pub replicas: Vec<SocketAddr>,
}

impl ClusterAssignment {
    pub fn primary(&self) -> Option<SocketAddr> {
        self.replicas.first().copied()
    }
}

/// What the coordinator needs to know about the cluster to fan a query
/// out. Implementations may be backed by gossip, a config file, a
/// coordination service — the coordinator doesn't care.
pub trait ClusterMetadata: Send + Sync {
    /// Every shard assignment for `index`, in shard-id order.
    fn shards_for(&self, index: &str) -> Vec<ClusterAssignment>;

    /// Every index this cluster knows about.
    fn indices(&self) -> Vec<String>;
}

/// A [`ClusterMetadata`] built once from a static table (typically loaded
/// from a config file) and never updated in place — rebalancing means
/// writing a new table and restarting the coordinator. This is the only
/// implementation this crate ships; production deployments with live
/// membership would swap in a different one behind the same trait.
pub struct StaticClusterMetadata {
    assignments: HashMap<String, Vec<ClusterAssignment>>,
}

impl StaticClusterMetadata {
    pub fn new(assignments: Vec<ClusterAssignment>) -> Self {
        let mut by_index: HashMap<String, Vec<ClusterAssignment>> = HashMap::new();
        for assignment in assignments {
            by_index.entry(assignment.index.clone()).or_default().push(assignment);
        }
        for shards in by_index.values_mut() {
            shards.sort_by_key(|a| a.shard_id);
        }
        Self { assignments: by_index }
    }
}

impl ClusterMetadata for StaticClusterMetadata {
    fn shards_for(&self, index: &str) -> Vec<ClusterAssignment> {
        self.assignments.get(index).cloned().unwrap_or_default()
    }

    fn indices(&self) -> Vec<String> {
        self.assignments.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn shards_for_returns_assignments_in_shard_order() {
        let meta = StaticClusterMetadata::new(vec![
            ClusterAssignment { index: "products".into(), shard_id: ShardId::new(1), replicas: vec![addr(9001)] },
            ClusterAssignment { index: "products".into(), shard_id: ShardId::new(0), replicas: vec![addr(9000)] },
        ]);
        let shards = meta.shards_for("products");
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].shard_id, ShardId::new(0));
        assert_eq!(shards[1].shard_id, ShardId::new(1));
    }

    #[test]
    fn unknown_index_has_no_assignments() {
        let meta = StaticClusterMetadata::new(vec![]);
        assert!(meta.shards_for("nope").is_empty());
    }

    #[test]
    fn primary_is_the_first_replica() {
        let a = ClusterAssignment { index: "i".into(), shard_id: ShardId::new(0), replicas: vec![addr(1), addr(2)] };
        assert_eq!(a.primary(), Some(addr(1)));
    }
}
