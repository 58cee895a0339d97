//! Host ABI (C6, spec §4.6): the `env` import namespace every UDF module
//! links against. Field/document accessors are keyed by `ctx_id`;
//! parameter accessors read the calling instance's own parameter table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use query_expr::TypedValue;
use wasmtime::{AsContextMut, Caller, Linker, Memory};

/// A single field/document-metadata view a UDF call sees. Implemented by
/// the shard's document plane (`core::document`), kept generic here so the
/// sandbox runtime has no dependency on the shard crate.
pub trait DocumentContext: Send + Sync {
    fn get_field(&self, name: &str) -> Option<TypedValue>;
    fn document_id(&self) -> &str;
    fn score(&self) -> f64;
}

struct ContextEntry {
    ctx: Arc<dyn DocumentContext>,
    accesses: AtomicUsize,
}

/// Per-instance state wired into every [`wasmtime::Store`]. `current_ctx_id`
/// is set by the registry immediately before invoking the UDF's exported
/// function and is the only thing that ties a host call back to its
/// registered context/parameter table.
pub struct HostState {
    pub host: Arc<HostFunctions>,
    pub current_ctx_id: i64,
}

impl Default for HostState {
    fn default() -> Self {
        Self { host: Arc::new(HostFunctions::new()), current_ctx_id: -1 }
    }
}

impl HostState {
    pub fn new(host: Arc<HostFunctions>) -> Self {
        Self { host, current_ctx_id: -1 }
    }
}

/// Process-wide table of in-flight document contexts and per-call
/// parameter tables, keyed by `ctx_id`. Coarse-grained: registration and
/// removal are rare relative to field lookups, so a `DashMap` (sharded
/// internally) is enough without a dedicated reader/writer lock.
pub struct HostFunctions {
    contexts: DashMap<i64, ContextEntry>,
    params: DashMap<i64, HashMap<String, TypedValue>>,
    next_id: AtomicI64,
}

impl HostFunctions {
    pub fn new() -> Self {
        Self { contexts: DashMap::new(), params: DashMap::new(), next_id: AtomicI64::new(1) }
    }

    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_context(&self, id: i64, ctx: Arc<dyn DocumentContext>) {
        self.contexts.insert(id, ContextEntry { ctx, accesses: AtomicUsize::new(0) });
    }

    pub fn unregister_context(&self, id: i64) {
        self.contexts.remove(&id);
    }

    pub fn register_params(&self, id: i64, params: HashMap<String, TypedValue>) {
        self.params.insert(id, params);
    }

    pub fn unregister_params(&self, id: i64) {
        self.params.remove(&id);
    }

    /// Total field/document accesses recorded against `ctx_id`, for tests
    /// that assert a UDF actually touched the document it was given.
    pub fn access_count(&self, id: i64) -> Option<usize> {
        self.contexts.get(&id).map(|e| e.accesses.load(Ordering::SeqCst))
    }

    fn touch(&self, id: i64) {
        if let Some(e) = self.contexts.get(&id) {
            e.accesses.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Default for HostFunctions {
    fn default() -> Self {
        Self::new()
    }
}

fn read_utf8(memory: &Memory, store: impl AsContextMut, ptr: i32, len: i32) -> Option<String> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let data = memory.data(store);
    let (ptr, len) = (ptr as usize, len as usize);
    data.get(ptr..ptr.checked_add(len)?).map(|b| String::from_utf8_lossy(b).into_owned())
}

fn write_bytes(memory: &Memory, mut store: impl AsContextMut, ptr: i32, bytes: &[u8]) -> bool {
    if ptr < 0 {
        return false;
    }
    let data = memory.data_mut(&mut store);
    let ptr = ptr as usize;
    match data.get_mut(ptr..ptr + bytes.len()) {
        Some(slice) => {
            slice.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

fn write_i32(memory: &Memory, store: impl AsContextMut, ptr: i32, value: i32) -> bool {
    write_bytes(memory, store, ptr, &value.to_le_bytes())
}

/// Writes `value` into the guest buffer at `out_ptr`, or, if it doesn't
/// fit, writes the required length to `out_len_ptr` and returns `false`
/// without touching `out_ptr` — the "caller retries with a larger buffer"
/// contract in §4.6.
fn write_string_out(
    memory: &Memory,
    mut store: impl AsContextMut,
    out_ptr: i32,
    out_len_ptr: i32,
    value: &str,
) -> bool {
    let bytes = value.as_bytes();
    let capacity = {
        let data = memory.data(&mut store);
        if out_len_ptr < 0 {
            return false;
        }
        let p = out_len_ptr as usize;
        match data.get(p..p + 4) {
            Some(b) => i32::from_le_bytes(b.try_into().unwrap()) as usize,
            None => return false,
        }
    };
    if bytes.len() > capacity {
        write_i32(memory, &mut store, out_len_ptr, bytes.len() as i32);
        return false;
    }
    if !write_bytes(memory, &mut store, out_ptr, bytes) {
        return false;
    }
    write_i32(memory, &mut store, out_len_ptr, bytes.len() as i32)
}

fn memory_of(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

/// Registers every `env` import the WASM module contract requires.
pub fn link_host_functions(linker: &mut Linker<HostState>) -> Result<(), wasmtime::Error> {
    linker.func_wrap(
        "env",
        "get_field_string",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, name_ptr: i32, name_len: i32, out_ptr: i32, out_len_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 0 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            let value = host.contexts.get(&ctx_id).and_then(|e| e.ctx.get_field(&name));
            match value {
                Some(TypedValue::String(s)) => {
                    if write_string_out(&memory, &mut caller, out_ptr, out_len_ptr, &s) { 1 } else { 0 }
                }
                _ => 0,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_field_int64",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, name_ptr: i32, name_len: i32| -> i64 {
            let Some(memory) = memory_of(&mut caller) else { return 0 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            match host.contexts.get(&ctx_id).and_then(|e| e.ctx.get_field(&name)) {
                Some(TypedValue::I64(v)) => v,
                Some(TypedValue::I32(v)) => v as i64,
                Some(TypedValue::Bool(b)) => b as i64,
                _ => 0,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_field_float64",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, name_ptr: i32, name_len: i32| -> f64 {
            let Some(memory) = memory_of(&mut caller) else { return 0.0 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 0.0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            host.contexts.get(&ctx_id).and_then(|e| e.ctx.get_field(&name)).and_then(|v| v.as_f64()).unwrap_or(0.0)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_field_bool",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, name_ptr: i32, name_len: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 0 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            match host.contexts.get(&ctx_id).and_then(|e| e.ctx.get_field(&name)) {
                Some(TypedValue::Bool(true)) => 1,
                _ => 0,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "has_field",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, name_ptr: i32, name_len: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 0 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            i32::from(host.contexts.get(&ctx_id).map(|e| e.ctx.get_field(&name).is_some()).unwrap_or(false))
        },
    )?;

    linker.func_wrap(
        "env",
        "get_document_id",
        |mut caller: Caller<'_, HostState>, ctx_id: i64, out_ptr: i32, out_len_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 0 };
            let host = caller.data().host.clone();
            host.touch(ctx_id);
            let id = match host.contexts.get(&ctx_id) {
                Some(e) => e.ctx.document_id().to_string(),
                None => return 0,
            };
            i32::from(write_string_out(&memory, &mut caller, out_ptr, out_len_ptr, &id))
        },
    )?;

    linker.func_wrap("env", "get_score", |caller: Caller<'_, HostState>, ctx_id: i64| -> f64 {
        let host = caller.data().host.clone();
        host.touch(ctx_id);
        host.contexts.get(&ctx_id).map(|e| e.ctx.score()).unwrap_or(0.0)
    })?;

    linker.func_wrap(
        "env",
        "log",
        |mut caller: Caller<'_, HostState>, msg_ptr: i32, msg_len: i32| {
            if let Some(memory) = memory_of(&mut caller) {
                if let Some(msg) = read_utf8(&memory, &mut caller, msg_ptr, msg_len) {
                    tracing::info!(target: "wasm_udf", "{msg}");
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_param_string",
        |mut caller: Caller<'_, HostState>, name_ptr: i32, name_len: i32, value_ptr: i32, value_len_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 3 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 3 };
            let ctx_id = caller.data().current_ctx_id;
            let host = caller.data().host.clone();
            let value = match host.params.get(&ctx_id).and_then(|p| p.get(&name).cloned()) {
                Some(v) => v,
                None => return 1,
            };
            match value {
                TypedValue::String(s) => {
                    if write_string_out(&memory, &mut caller, value_ptr, value_len_ptr, &s) { 0 } else { 3 }
                }
                _ => 2,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_param_i64",
        |mut caller: Caller<'_, HostState>, name_ptr: i32, name_len: i32, out_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 3 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 3 };
            let ctx_id = caller.data().current_ctx_id;
            let host = caller.data().host.clone();
            let value = match host.params.get(&ctx_id).and_then(|p| p.get(&name).cloned()) {
                Some(v) => v,
                None => return 1,
            };
            let word = match value {
                TypedValue::I64(v) => v,
                TypedValue::I32(v) => v as i64,
                TypedValue::Bool(b) => b as i64,
                _ => return 2,
            };
            if write_bytes(&memory, &mut caller, out_ptr, &word.to_le_bytes()) { 0 } else { 3 }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_param_f64",
        |mut caller: Caller<'_, HostState>, name_ptr: i32, name_len: i32, out_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 3 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 3 };
            let ctx_id = caller.data().current_ctx_id;
            let host = caller.data().host.clone();
            let value = match host.params.get(&ctx_id).and_then(|p| p.get(&name).cloned()) {
                Some(v) => v,
                None => return 1,
            };
            let word = match value {
                TypedValue::F64(v) => v,
                TypedValue::F32(v) => v as f64,
                _ => return 2,
            };
            if write_bytes(&memory, &mut caller, out_ptr, &word.to_le_bytes()) { 0 } else { 3 }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_param_bool",
        |mut caller: Caller<'_, HostState>, name_ptr: i32, name_len: i32, out_ptr: i32| -> i32 {
            let Some(memory) = memory_of(&mut caller) else { return 3 };
            let Some(name) = read_utf8(&memory, &mut caller, name_ptr, name_len) else { return 3 };
            let ctx_id = caller.data().current_ctx_id;
            let host = caller.data().host.clone();
            let value = match host.params.get(&ctx_id).and_then(|p| p.get(&name).cloned()) {
                Some(v) => v,
                None => return 1,
            };
            let word: i32 = match value {
                TypedValue::Bool(b) => b as i32,
                _ => return 2,
            };
            if write_bytes(&memory, &mut caller, out_ptr, &word.to_le_bytes()) { 0 } else { 3 }
        },
    )?;

    Ok(())
}
