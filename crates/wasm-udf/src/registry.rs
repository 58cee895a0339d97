//! UDF registry (C7, spec §4.7): a `name@version` catalog of compiled UDFs,
//! their declared parameter/return schema, and the call path that bridges
//! typed parameters and a document context into a sandboxed invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use query_expr::{to_word, DType, TypedValue};
use wasmtime::Val;

use crate::host::DocumentContext;
use crate::runtime::{RuntimeError, WasmRuntime};

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub tag: DType,
    pub required: bool,
    pub default: Option<TypedValue>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub tag: DType,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct UdfMetadata {
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub params: Vec<Param>,
    pub returns: Vec<Return>,
    /// Carried out-of-band from the persistable JSON shape — never
    /// round-tripped through `serde` with the rest of the metadata.
    pub wasm_bytes: Vec<u8>,
    pub created_at: time::OffsetDateTime,
    pub tags: Vec<String>,
    pub category: String,
}

impl UdfMetadata {
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.params {
            if !seen.insert(&p.name) {
                return Err(RegistryError::DuplicateParamName(p.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct UdfStats {
    pub calls: u64,
    pub errors: u64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    total: Duration,
}

impl UdfStats {
    pub fn avg(&self) -> Option<Duration> {
        if self.calls == 0 {
            None
        } else {
            Some(self.total / self.calls as u32)
        }
    }

    fn record(&mut self, elapsed: Duration, failed: bool) {
        self.calls += 1;
        if failed {
            self.errors += 1;
        }
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
    }
}

struct Entry {
    metadata: UdfMetadata,
    pool_size: usize,
    stats: UdfStats,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("udf {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("param name {0:?} is declared more than once")]
    DuplicateParamName(String),

    #[error("udf {0:?} not found")]
    UdfNotFound(String),

    #[error("required param {0:?} missing")]
    RequiredParamMissing(String),

    #[error("unknown param {0:?}")]
    UnknownParam(String),

    #[error("param {name:?} expected tag {expected:?}")]
    ParamTypeMismatch { name: String, expected: DType },

    #[error("sandbox trap: {0}")]
    SandboxTrap(String),

    #[error("could not decode udf result: {0}")]
    ResultDecodeError(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// `name@version` catalog, coarse-locked since registration/removal are
/// rare relative to lookups and calls.
pub struct UdfRegistry {
    runtime: Arc<WasmRuntime>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl UdfRegistry {
    pub fn new(runtime: Arc<WasmRuntime>) -> Self {
        Self { runtime, entries: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, metadata: UdfMetadata, pool_size: usize) -> Result<(), RegistryError> {
        metadata.validate()?;
        let identity = metadata.identity();
        {
            let entries = self.entries.read();
            if entries.contains_key(&identity) {
                return Err(RegistryError::AlreadyRegistered(identity));
            }
        }
        self.runtime.compile_module(&identity, &metadata.wasm_bytes)?;
        self.runtime.pool(&identity, pool_size)?;
        self.entries.write().insert(identity, Entry { metadata, pool_size, stats: UdfStats::default() });
        Ok(())
    }

    pub fn unregister(&self, name: &str, version: &str) -> Result<(), RegistryError> {
        let identity = format!("{name}@{version}");
        let mut entries = self.entries.write();
        if entries.remove(&identity).is_none() {
            return Err(RegistryError::UdfNotFound(identity));
        }
        self.runtime.unload(&identity);
        Ok(())
    }

    pub fn get(&self, name: &str, version: &str) -> Option<UdfMetadata> {
        self.entries.read().get(&format!("{name}@{version}")).map(|e| e.metadata.clone())
    }

    pub fn get_latest(&self, name: &str) -> Option<UdfMetadata> {
        self.entries
            .read()
            .values()
            .filter(|e| e.metadata.name == name)
            .max_by_key(|e| e.metadata.created_at)
            .map(|e| e.metadata.clone())
    }

    pub fn list(&self) -> Vec<UdfMetadata> {
        self.entries.read().values().map(|e| e.metadata.clone()).collect()
    }

    pub fn query(&self, tag: Option<&str>, category: Option<&str>) -> Vec<UdfMetadata> {
        self.entries
            .read()
            .values()
            .filter(|e| tag.map_or(true, |t| e.metadata.tags.iter().any(|x| x == t)))
            .filter(|e| category.map_or(true, |c| e.metadata.category == c))
            .map(|e| e.metadata.clone())
            .collect()
    }

    pub fn stats(&self, name: &str, version: &str) -> Option<UdfStats> {
        self.entries.read().get(&format!("{name}@{version}")).map(|e| e.stats.clone())
    }

    /// Validates `params` against the declared schema, runs the UDF inside
    /// a pooled sandbox instance, and decodes its positional results —
    /// registering and tearing down the context/parameter tables on every
    /// exit path, including early returns on validation failure.
    pub fn call(
        &self,
        name: &str,
        version: &str,
        doc_ctx: Arc<dyn DocumentContext>,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<Vec<TypedValue>, RegistryError> {
        let identity = format!("{name}@{version}");
        let (metadata, pool_size) = {
            let entries = self.entries.read();
            let e = entries.get(&identity).ok_or_else(|| RegistryError::UdfNotFound(identity.clone()))?;
            (e.metadata.clone(), e.pool_size)
        };

        let typed_params = validate_params(&metadata.params, &params)?;

        let host = self.runtime.host();
        let ctx_id = host.next_id();
        host.register_context(ctx_id, doc_ctx);
        host.register_params(ctx_id, typed_params.clone());

        let result = self.invoke(&identity, pool_size, ctx_id, &metadata, &typed_params);

        host.unregister_params(ctx_id);
        host.unregister_context(ctx_id);

        let mut entries = self.entries.write();
        if let Some(e) = entries.get_mut(&identity) {
            let (elapsed, failed) = match &result {
                Ok((_, elapsed)) => (*elapsed, false),
                Err((_, elapsed)) => (*elapsed, true),
            };
            e.stats.record(elapsed, failed);
        }

        match result {
            Ok((values, _)) => Ok(values),
            Err((e, _)) => Err(e),
        }
    }

    fn invoke(
        &self,
        identity: &str,
        pool_size: usize,
        ctx_id: i64,
        metadata: &UdfMetadata,
        typed_params: &HashMap<String, TypedValue>,
    ) -> Result<(Vec<TypedValue>, Duration), (RegistryError, Duration)> {
        let start = Instant::now();
        let pool = match self.runtime.pool(identity, pool_size) {
            Ok(p) => p,
            Err(e) => return Err((e.into(), start.elapsed())),
        };
        let mut instance = match pool.get() {
            Ok(i) => i,
            Err(e) => return Err((e.into(), start.elapsed())),
        };
        instance.store.data_mut().current_ctx_id = ctx_id;

        let args = match build_arg_vector(ctx_id, &metadata.params, typed_params) {
            Ok(a) => a,
            Err(e) => {
                pool.put(instance);
                return Err((e, start.elapsed()));
            }
        };

        let func = match instance.instance.get_func(&mut instance.store, &metadata.function_name) {
            Some(f) => f,
            None => {
                pool.put(instance);
                return Err((RegistryError::SandboxTrap(format!("export {:?} not found", metadata.function_name)), start.elapsed()));
            }
        };

        let vals: Vec<Val> = args.into_iter().map(Val::I64).collect();
        let mut results = vec![Val::I64(0); metadata.returns.len()];
        let call_result = func.call(&mut instance.store, &vals, &mut results);

        let decoded = match call_result {
            Ok(()) => decode_results(&metadata.returns, &results),
            Err(e) => Err(RegistryError::SandboxTrap(e.to_string())),
        };

        pool.put(instance);
        match decoded {
            Ok(values) => Ok((values, start.elapsed())),
            Err(e) => Err((e, start.elapsed())),
        }
    }
}

fn validate_params(
    declared: &[Param],
    given: &HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, TypedValue>, RegistryError> {
    let declared_names: std::collections::HashSet<&str> = declared.iter().map(|p| p.name.as_str()).collect();
    for name in given.keys() {
        if !declared_names.contains(name.as_str()) {
            return Err(RegistryError::UnknownParam(name.clone()));
        }
    }

    let mut out = HashMap::new();
    for p in declared {
        match given.get(&p.name) {
            Some(v) => out.insert(p.name.clone(), json_to_typed(v, p.tag).ok_or_else(|| RegistryError::ParamTypeMismatch {
                name: p.name.clone(),
                expected: p.tag,
            })?),
            None => {
                if let Some(default) = &p.default {
                    out.insert(p.name.clone(), default.clone())
                } else if p.required {
                    return Err(RegistryError::RequiredParamMissing(p.name.clone()));
                } else {
                    continue;
                }
            }
        };
    }
    Ok(out)
}

fn json_to_typed(v: &serde_json::Value, tag: DType) -> Option<TypedValue> {
    match tag {
        DType::Bool => v.as_bool().map(TypedValue::Bool),
        DType::I32 => v.as_i64().map(|n| TypedValue::I32(n as i32)),
        DType::I64 => v.as_i64().map(TypedValue::I64),
        DType::F32 => v.as_f64().map(|n| TypedValue::F32(n as f32)),
        DType::F64 => v.as_f64().map(TypedValue::F64),
        DType::String => v.as_str().map(|s| TypedValue::String(s.to_string())),
    }
}

/// Builds the declaration-order argument vector: `ctx_id` first, then one
/// word per declared param (strings excluded — read back via
/// `get_param_string`), per §4.7 step 5.
fn build_arg_vector(
    ctx_id: i64,
    declared: &[Param],
    values: &HashMap<String, TypedValue>,
) -> Result<Vec<i64>, RegistryError> {
    let mut args = vec![ctx_id];
    for p in declared {
        if p.tag == DType::String {
            continue;
        }
        let value = values.get(&p.name).cloned().or_else(|| p.default.clone());
        let word = match value {
            Some(v) => to_word(&v).map_err(|_| RegistryError::ParamTypeMismatch { name: p.name.clone(), expected: p.tag })?,
            None => 0,
        };
        args.push(word as i64);
    }
    Ok(args)
}

fn decode_results(declared: &[Return], results: &[Val]) -> Result<Vec<TypedValue>, RegistryError> {
    declared
        .iter()
        .zip(results.iter())
        .map(|(r, val)| {
            let word = val.i64().ok_or_else(|| RegistryError::ResultDecodeError("expected i64 return word".into()))? as u64;
            query_expr::from_word(r.tag, word).map_err(|e| RegistryError::ResultDecodeError(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CompileMode, RuntimeConfig};

    struct FakeDoc {
        fields: HashMap<String, TypedValue>,
        id: String,
    }

    impl DocumentContext for FakeDoc {
        fn get_field(&self, name: &str) -> Option<TypedValue> {
            self.fields.get(name).cloned()
        }

        fn document_id(&self) -> &str {
            &self.id
        }

        fn score(&self) -> f64 {
            1.0
        }
    }

    fn registry() -> UdfRegistry {
        let runtime = WasmRuntime::new(RuntimeConfig { mode: CompileMode::Jit, ..Default::default() }).unwrap();
        UdfRegistry::new(Arc::new(runtime))
    }

    fn constant_bool_module(value: i64) -> UdfMetadata {
        let wat = format!(
            r#"(module (memory (export "memory") 1) (func (export "run") (param i64) (result i64) (i64.const {value})))"#
        );
        let bytes = wat::parse_str(wat).unwrap();
        UdfMetadata {
            name: if value == 1 { "always_true".into() } else { "always_false".into() },
            version: "1".into(),
            function_name: "run".into(),
            params: Vec::new(),
            returns: vec![Return { tag: DType::Bool, description: "verdict".into() }],
            wasm_bytes: bytes,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            tags: Vec::new(),
            category: "test".into(),
        }
    }

    #[test]
    fn always_true_and_always_false() {
        let reg = registry();
        reg.register(constant_bool_module(1), 1).unwrap();
        reg.register(constant_bool_module(0), 1).unwrap();

        let doc = Arc::new(FakeDoc { fields: HashMap::new(), id: "doc-1".into() });
        let result = reg.call("always_true", "1", doc.clone(), HashMap::new()).unwrap();
        assert_eq!(result, vec![TypedValue::Bool(true)]);

        let result = reg.call("always_false", "1", doc, HashMap::new()).unwrap();
        assert_eq!(result, vec![TypedValue::Bool(false)]);
    }

    fn threshold_module() -> UdfMetadata {
        let wat = r#"
            (module
              (import "env" "get_field_int64" (func $get_field_int64 (param i64 i32 i32) (result i64)))
              (import "env" "get_param_i64" (func $get_param_i64 (param i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "score")
              (data (i32.const 16) "min")
              (func (export "check") (param $ctx i64) (result i64)
                (local $score i64)
                (local $rc i32)
                (local.set $score (call $get_field_int64 (local.get $ctx) (i32.const 0) (i32.const 5)))
                (local.set $rc (call $get_param_i64 (i32.const 16) (i32.const 3) (i32.const 32)))
                (if (i32.ne (local.get $rc) (i32.const 0)) (then (return (i64.const 0))))
                (if (i64.ge_s (local.get $score) (i64.load (i32.const 32))) (then (return (i64.const 1))))
                (i64.const 0)
              )
            )
        "#;
        let bytes = wat::parse_str(wat).unwrap();
        UdfMetadata {
            name: "threshold".into(),
            version: "1".into(),
            function_name: "check".into(),
            params: vec![Param { name: "min".into(), tag: DType::I64, required: true, default: None, description: String::new() }],
            returns: vec![Return { tag: DType::Bool, description: "above threshold".into() }],
            wasm_bytes: bytes,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            tags: Vec::new(),
            category: "test".into(),
        }
    }

    #[test]
    fn typed_parameter_passing_and_field_access() {
        let reg = registry();
        reg.register(threshold_module(), 1).unwrap();

        let mut fields = HashMap::new();
        fields.insert("score".to_string(), TypedValue::I64(42));
        let doc = Arc::new(FakeDoc { fields, id: "doc-1".into() });

        let mut params = HashMap::new();
        params.insert("min".to_string(), serde_json::json!(10));
        let result = reg.call("threshold", "1", doc.clone(), params).unwrap();
        assert_eq!(result, vec![TypedValue::Bool(true)]);

        let mut params = HashMap::new();
        params.insert("min".to_string(), serde_json::json!(100));
        let result = reg.call("threshold", "1", doc, params).unwrap();
        assert_eq!(result, vec![TypedValue::Bool(false)]);
    }

    #[test]
    fn required_param_missing_is_rejected() {
        let reg = registry();
        reg.register(threshold_module(), 1).unwrap();
        let doc = Arc::new(FakeDoc { fields: HashMap::new(), id: "doc-1".into() });
        let err = reg.call("threshold", "1", doc, HashMap::new()).unwrap_err();
        assert!(matches!(err, RegistryError::RequiredParamMissing(name) if name == "min"));
    }

    #[test]
    fn context_and_params_are_unregistered_after_call() {
        let reg = registry();
        reg.register(threshold_module(), 1).unwrap();
        let doc = Arc::new(FakeDoc { fields: HashMap::new(), id: "doc-1".into() });

        let mut params = HashMap::new();
        params.insert("min".to_string(), serde_json::json!(1));
        let _ = reg.call("threshold", "1", doc, params);

        // the host registry should not be leaking any entries after the call
        // returns, regardless of whether it succeeded
        let host = reg.runtime.host();
        assert_eq!(host.access_count(1), None);
    }

    #[test]
    fn re_registration_of_same_identity_fails() {
        let reg = registry();
        reg.register(constant_bool_module(1), 1).unwrap();
        let err = reg.register(constant_bool_module(1), 1).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn unknown_param_is_rejected() {
        let reg = registry();
        reg.register(threshold_module(), 1).unwrap();
        let doc = Arc::new(FakeDoc { fields: HashMap::new(), id: "doc-1".into() });
        let mut params = HashMap::new();
        params.insert("min".to_string(), serde_json::json!(1));
        params.insert("bogus".to_string(), serde_json::json!(1));
        let err = reg.call("threshold", "1", doc, params).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownParam(name) if name == "bogus"));
    }
}
