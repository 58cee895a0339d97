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

//! Small set of conventions shared across the workspace: the bincode dialect
//! every wire/on-disk encoding uses, and the shard-routing hash that the
//! coordinator and shard manager must never disagree on.

/// The single bincode configuration used for every on-disk and on-wire encoding
/// in the workspace. Centralised here so that every crate speaks the same
/// binary dialect and a format change only needs to happen in one place.
pub fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_little_endian().with_variable_int_encoding()
}

/// FNV-1a over arbitrary bytes. Deterministic across processes and
/// versions, which is the only property the shard-routing hash needs.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Which of `total_shards` a document id routes to. Shared by the shard
/// manager (to decide what it hosts) and the coordinator (to decide where
/// to send it) so the two never disagree about where a document lives.
pub fn shard_for(doc_id: &str, total_shards: u64) -> u64 {
    fnv1a_64(doc_id.as_bytes()) % total_shards.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_for_is_deterministic_and_in_range() {
        let a = shard_for("doc-123", 8);
        let b = shard_for("doc-123", 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }
}
