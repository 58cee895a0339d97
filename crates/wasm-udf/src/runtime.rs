//! Sandbox runtime (C5, spec §4.5): compiles WASM modules, instantiates
//! them, and pools instances per module name.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use wasmtime::{Config, Engine as WasmEngine, Instance, Linker, Memory, Module, Store, Strategy};

use crate::host::{HostFunctions, HostState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Jit,
    Interpreter,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: CompileMode,
    pub max_memory_pages: u32,
    /// Epoch ticks (roughly milliseconds, driven by a background ticker
    /// the owning process is responsible for starting) after which an
    /// in-flight call traps instead of running forever.
    pub call_deadline_epochs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { mode: CompileMode::Jit, max_memory_pages: 256, call_deadline_epochs: 200 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("module {0:?} is already compiled")]
    AlreadyExists(String),

    #[error("module {0:?} is not known to the runtime")]
    UnknownModule(String),

    #[error("module does not satisfy the WASM module contract: {0}")]
    InvalidModule(String),

    #[error("wasmtime error: {0}")]
    Wasmtime(String),
}

impl From<wasmtime::Error> for RuntimeError {
    fn from(e: wasmtime::Error) -> Self {
        RuntimeError::Wasmtime(e.to_string())
    }
}

/// An immutable, freely shareable compiled module.
#[derive(Clone)]
pub struct CompiledModule {
    pub name: String,
    pub module: Module,
}

/// A single sandbox instance: one linear memory, one set of exports. Used
/// by at most one caller at a time — enforced by the pool that hands it
/// out, never by the instance itself.
pub struct ModuleInstance {
    pub store: Store<HostState>,
    pub instance: Instance,
    pub memory: Memory,
}

/// FIFO pool of instances for a single module. `get` hands out an idle
/// instance or, while under `cap`, builds a fresh one; `put` returns it.
pub struct ModulePool {
    compiled: CompiledModule,
    linker: Arc<Linker<HostState>>,
    engine: WasmEngine,
    host: Arc<HostFunctions>,
    idle: Mutex<VecDeque<ModuleInstance>>,
    cap: usize,
    outstanding: AtomicU64,
}

impl ModulePool {
    fn new(compiled: CompiledModule, linker: Arc<Linker<HostState>>, engine: WasmEngine, host: Arc<HostFunctions>, cap: usize) -> Self {
        Self { compiled, linker, engine, host, idle: Mutex::new(VecDeque::new()), cap, outstanding: AtomicU64::new(0) }
    }

    fn fresh_instance(&self) -> Result<ModuleInstance, RuntimeError> {
        let mut store = Store::new(&self.engine, HostState::new(self.host.clone()));
        store.set_epoch_deadline(1);
        let instance = self.linker.instantiate(&mut store, &self.compiled.module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| RuntimeError::InvalidModule("module does not export `memory`".into()))?;
        Ok(ModuleInstance { store, instance, memory })
    }

    /// Blocks (spins, backed by the pool's mutex) until an instance is
    /// available, or creates one if the pool is still under `cap`.
    pub fn get(&self) -> Result<ModuleInstance, RuntimeError> {
        loop {
            if let Some(inst) = self.idle.lock().pop_front() {
                return Ok(inst);
            }
            let in_flight = self.outstanding.load(Ordering::SeqCst) as usize;
            if in_flight < self.cap {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return self.fresh_instance();
            }
            std::thread::yield_now();
        }
    }

    pub fn put(&self, instance: ModuleInstance) {
        self.idle.lock().push_back(instance);
    }
}

/// Owns compiled modules and their instance pools for one process.
pub struct WasmRuntime {
    config: RuntimeConfig,
    engine: WasmEngine,
    linker: Arc<Linker<HostState>>,
    host: Arc<HostFunctions>,
    modules: Mutex<HashMap<String, CompiledModule>>,
    pools: Mutex<HashMap<String, Arc<ModulePool>>>,
}

impl WasmRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_host(config, Arc::new(HostFunctions::new()))
    }

    /// Builds a runtime over a caller-supplied [`HostFunctions`] registry —
    /// the UDF registry (C7) needs this so it can register contexts and
    /// parameter tables against the same instance the runtime links.
    pub fn with_host(config: RuntimeConfig, host: Arc<HostFunctions>) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.strategy(match config.mode {
            CompileMode::Jit => Strategy::Cranelift,
            CompileMode::Interpreter => Strategy::Winch,
        });
        wasmtime_config.epoch_interruption(true);
        let engine = WasmEngine::new(&wasmtime_config)?;
        let mut linker = Linker::new(&engine);
        crate::host::link_host_functions(&mut linker)?;
        Ok(Self { config, engine, linker: Arc::new(linker), host, modules: Mutex::new(HashMap::new()), pools: Mutex::new(HashMap::new()) })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host(&self) -> Arc<HostFunctions> {
        self.host.clone()
    }

    /// Advances every store's epoch deadline clock by one tick. The owning
    /// process runs this from a timer so in-flight calls eventually trap
    /// instead of running forever.
    pub fn tick_epoch(&self) {
        self.engine.increment_epoch();
    }

    pub fn compile_module(&self, name: &str, bytes: &[u8]) -> Result<(), RuntimeError> {
        let mut modules = self.modules.lock();
        if modules.contains_key(name) {
            return Err(RuntimeError::AlreadyExists(name.to_string()));
        }
        let module = Module::new(&self.engine, bytes)?;
        modules.insert(name.to_string(), CompiledModule { name: name.to_string(), module });
        Ok(())
    }

    pub fn instantiate(&self, name: &str) -> Result<ModuleInstance, RuntimeError> {
        let compiled = self.modules.lock().get(name).cloned().ok_or_else(|| RuntimeError::UnknownModule(name.to_string()))?;
        let mut store = Store::new(&self.engine, HostState::new(self.host.clone()));
        store.set_epoch_deadline(1);
        let instance = self.linker.instantiate(&mut store, &compiled.module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| RuntimeError::InvalidModule("module does not export `memory`".into()))?;
        Ok(ModuleInstance { store, instance, memory })
    }

    pub fn pool(&self, name: &str, size: usize) -> Result<Arc<ModulePool>, RuntimeError> {
        let mut pools = self.pools.lock();
        if let Some(p) = pools.get(name) {
            return Ok(p.clone());
        }
        let compiled = self.modules.lock().get(name).cloned().ok_or_else(|| RuntimeError::UnknownModule(name.to_string()))?;
        let pool = Arc::new(ModulePool::new(compiled, self.linker.clone(), self.engine.clone(), self.host.clone(), size));
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    pub fn unload(&self, name: &str) {
        self.pools.lock().remove(name);
        self.modules.lock().remove(name);
    }

    pub fn close(&self) {
        self.pools.lock().clear();
        self.modules.lock().clear();
    }
}
