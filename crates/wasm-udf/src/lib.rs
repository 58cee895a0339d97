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

//! Sandboxed WASM user-defined-function runtime: module pools (C5), the
//! host ABI UDFs call into (C6), and the name@version registry that wires
//! the two together for a single invocation (C7).

pub mod host;
pub mod registry;
pub mod runtime;

pub use host::{DocumentContext, HostFunctions, HostState};
pub use registry::{Param, RegistryError, Return, UdfMetadata, UdfRegistry, UdfStats};
pub use runtime::{CompileMode, CompiledModule, ModuleInstance, ModulePool, RuntimeConfig, RuntimeError, WasmRuntime};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
