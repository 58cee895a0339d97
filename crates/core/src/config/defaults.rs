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

//! Default-value providers for the config structs in [`super`], used via
//! `#[serde(default = "...")]` so every field in a config TOML is
//! optional. One submodule per config struct, matching the teacher's
//! `config::defaults` layout.

pub mod shard_manager {
    pub fn total_shards() -> u64 {
        4
    }
}

pub mod coordinator {
    pub fn deadline_ms() -> u64 {
        2_000
    }

    pub fn max_result_window() -> usize {
        10_000
    }

    pub fn connect_timeout_ms() -> u64 {
        500
    }
}

pub mod wasm_runtime {
    pub fn max_memory_pages() -> u32 {
        256
    }

    pub fn call_deadline_epochs() -> u64 {
        200
    }

    pub fn epoch_tick_ms() -> u64 {
        1
    }

    pub fn udf_pool_size() -> usize {
        4
    }
}

pub mod api {
    pub fn max_result_window() -> usize {
        10_000
    }
}
