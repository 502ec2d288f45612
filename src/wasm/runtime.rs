//! Wasmtime embedding of the WebAssembly engine.
//!
//! One `WasmtimeRuntime` is created per module of a deployment, preopening
//! exactly that module's mount root as `.`. Loading caches a serialized form
//! of the compiled module next to the source binary and reuses it on later
//! loads while it is newer than the source.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, Store, Val, ValType};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::error::SupervisorError;
use crate::util::constants::{MEMORY_EXPORT_NAME, SERIALIZED_MODULE_SUFFIX};
use crate::wasm::imports;

/// Reference point for the `sys.millis` import.
pub static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Store data available to host functions.
pub struct HostState {
    pub wasi: WasiP1Ctx,
    /// Name of the module currently being invoked on this runtime. Set at the
    /// start of every invocation; read by host functions that need to know
    /// their caller. One runtime per module keeps this race-free as long as
    /// invocations on a single runtime are serialised.
    pub current_module: Option<String>,
}

/// Which engine binding was requested through `WASM_RUNTIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Wasmtime,
    Wasm3,
}

/// Engine selection from the environment, defaulting to wasmtime.
pub fn selected_runtime() -> RuntimeKind {
    match std::env::var("WASM_RUNTIME") {
        Ok(v) if v == "wasm3" => RuntimeKind::Wasm3,
        _ => RuntimeKind::Wasmtime,
    }
}

/// An isolated execution environment for one module: engine, store, linker
/// and the instances loaded into it.
pub struct WasmtimeRuntime {
    engine: Engine,
    store: Store<HostState>,
    linker: Linker<HostState>,
    instances: HashMap<String, Instance>,
}

impl WasmtimeRuntime {
    /// Create a runtime whose WASI filesystem view is rooted at `mount_root`.
    pub fn new(mount_root: &Path) -> Result<Self, SupervisorError> {
        std::fs::create_dir_all(mount_root)?;

        let engine = Engine::new(&Config::default())
            .map_err(|e| SupervisorError::ModuleLoad(format!("engine setup failed: {}", e)))?;

        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_env();
        builder
            .preopened_dir(mount_root, ".", DirPerms::all(), FilePerms::all())
            .map_err(|e| {
                SupervisorError::ModuleLoad(format!(
                    "preopening {} failed: {}",
                    mount_root.display(),
                    e
                ))
            })?;
        let wasi = builder.build_p1();

        let store = Store::new(
            &engine,
            HostState {
                wasi,
                current_module: None,
            },
        );

        let mut linker: Linker<HostState> = Linker::new(&engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| {
            &mut state.wasi
        })
        .map_err(|e| SupervisorError::ModuleLoad(format!("WASI linkage failed: {}", e)))?;
        // Our random_get shadows the stock WASI one.
        linker.allow_shadowing(true);
        imports::link_host_functions(&mut linker)
            .map_err(|e| SupervisorError::ModuleLoad(format!("host-function linkage failed: {}", e)))?;

        Ok(Self {
            engine,
            store,
            linker,
            instances: HashMap::new(),
        })
    }

    /// Load and instantiate a module, reusing an already-loaded instance of
    /// the same name.
    pub fn get_or_load(
        &mut self,
        name: &str,
        binary_path: &Path,
    ) -> Result<(), SupervisorError> {
        if self.instances.contains_key(name) {
            debug!("Module '{}' already loaded", name);
            return Ok(());
        }

        let module = load_or_compile(&self.engine, binary_path).map_err(|e| {
            SupervisorError::ModuleLoad(format!(
                "could not load '{}' from {}: {}",
                name,
                binary_path.display(),
                e
            ))
        })?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(|e| {
                SupervisorError::ModuleLoad(format!("could not instantiate '{}': {}", name, e))
            })?;
        self.instances.insert(name.to_string(), instance);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Parameter types of an exported function, used to coerce query
    /// arguments into typed primitives.
    pub fn arg_types(
        &mut self,
        module_name: &str,
        function_name: &str,
    ) -> Result<Vec<ValType>, SupervisorError> {
        let instance = self.instance(module_name)?;
        let func = instance
            .get_func(&mut self.store, function_name)
            .ok_or_else(|| {
                SupervisorError::Invocation(format!(
                    "function '{}' not found in module '{}'",
                    function_name, module_name
                ))
            })?;
        Ok(func.ty(&self.store).params().collect())
    }

    /// Run an exported function. Returns the single primitive the function
    /// produced, or `None` for void functions.
    pub fn invoke(
        &mut self,
        module_name: &str,
        function_name: &str,
        params: Vec<Val>,
    ) -> Result<Option<Val>, SupervisorError> {
        let instance = self.instance(module_name)?;
        let func = instance
            .get_func(&mut self.store, function_name)
            .ok_or_else(|| {
                SupervisorError::Invocation(format!(
                    "function '{}' not found in module '{}'",
                    function_name, module_name
                ))
            })?;

        self.store.data_mut().current_module = Some(module_name.to_string());

        debug!(
            "({}) Running function '{}' with {} argument(s)",
            module_name,
            function_name,
            params.len()
        );
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];
        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| {
                SupervisorError::Invocation(format!("'{}' trapped: {}", function_name, e))
            })?;
        Ok(results.into_iter().next())
    }

    /// Read a block of the module's linear memory. Out-of-bounds reads are
    /// reported as errors, never panics.
    pub fn read_memory(
        &mut self,
        module_name: &str,
        address: usize,
        length: usize,
    ) -> Result<Vec<u8>, SupervisorError> {
        let memory = self.memory(module_name)?;
        let data = memory.data(&self.store);
        let end = address.checked_add(length).filter(|end| *end <= data.len());
        match end {
            Some(end) => Ok(data[address..end].to_vec()),
            None => Err(SupervisorError::Memory(format!(
                "reading {} bytes at address {} is out of bounds for module '{}'",
                length, address, module_name
            ))),
        }
    }

    /// Write a block into the module's linear memory, bounds-checked.
    pub fn write_memory(
        &mut self,
        module_name: &str,
        address: usize,
        bytes: &[u8],
    ) -> Result<(), SupervisorError> {
        let memory = self.memory(module_name)?;
        let data = memory.data_mut(&mut self.store);
        let end = address
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len());
        match end {
            Some(end) => {
                data[address..end].copy_from_slice(bytes);
                Ok(())
            }
            None => Err(SupervisorError::Memory(format!(
                "writing {} bytes at address {} is out of bounds for module '{}'",
                bytes.len(),
                address,
                module_name
            ))),
        }
    }

    fn instance(&self, module_name: &str) -> Result<Instance, SupervisorError> {
        self.instances.get(module_name).copied().ok_or_else(|| {
            SupervisorError::ModuleLoad(format!("module '{}' is not loaded", module_name))
        })
    }

    fn memory(&mut self, module_name: &str) -> Result<Memory, SupervisorError> {
        let instance = self.instance(module_name)?;
        instance
            .get_memory(&mut self.store, MEMORY_EXPORT_NAME)
            .ok_or_else(|| {
                SupervisorError::Memory(format!(
                    "module '{}' exports no linear memory named \"{}\"",
                    module_name, MEMORY_EXPORT_NAME
                ))
            })
    }
}

/// Compile a module from source, or deserialize the cached compiled form when
/// it is newer than the source.
fn load_or_compile(engine: &Engine, path: &Path) -> anyhow::Result<Module> {
    let serialized = serialized_module_path(path);

    if cache_is_fresh(path, &serialized) {
        // SAFETY: the cache file is only ever written below from
        // `Module::serialize` with the same engine configuration.
        match unsafe { Module::deserialize_file(engine, &serialized) } {
            Ok(module) => {
                debug!("Loaded serialized module from {}", serialized.display());
                return Ok(module);
            }
            Err(e) => warn!(
                "Could not load serialized module {}: {}",
                serialized.display(),
                e
            ),
        }
    }

    info!("Compiling module from source {}", path.display());
    let module = Module::from_file(engine, path)?;
    match module.serialize() {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(&serialized, bytes) {
                warn!("Could not write module cache {}: {}", serialized.display(), e);
            }
        }
        Err(e) => warn!("Could not serialize module {}: {}", path.display(), e),
    }
    Ok(module)
}

/// Path of the compiled-module cache next to the source binary.
pub fn serialized_module_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(SERIALIZED_MODULE_SUFFIX);
    std::path::PathBuf::from(os)
}

fn cache_is_fresh(source: &Path, serialized: &Path) -> bool {
    let (Ok(source_meta), Ok(cache_meta)) =
        (std::fs::metadata(source), std::fs::metadata(serialized))
    else {
        return false;
    };
    match (source_meta.modified(), cache_meta.modified()) {
        (Ok(source_mtime), Ok(cache_mtime)) => cache_mtime > source_mtime,
        _ => false,
    }
}

/// Map a WebAssembly primitive to its JSON representation.
pub fn val_to_json(val: Option<&Val>) -> Value {
    match val {
        Some(Val::I32(i)) => json!(i),
        Some(Val::I64(i)) => json!(i),
        Some(Val::F32(bits)) => json!(f32::from_bits(*bits)),
        Some(Val::F64(bits)) => json!(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

/// Parse one query argument into the primitive the function signature
/// declares at that position.
pub fn coerce_arg(raw: &str, ty: &ValType) -> Result<Val, SupervisorError> {
    let parse_failure = |kind: &str| {
        SupervisorError::Invocation(format!("could not parse '{}' as {}", raw, kind))
    };
    match ty {
        ValType::I32 => raw
            .parse::<i32>()
            .map(Val::I32)
            .map_err(|_| parse_failure("i32")),
        ValType::I64 => raw
            .parse::<i64>()
            .map(Val::I64)
            .map_err(|_| parse_failure("i64")),
        ValType::F32 => raw
            .parse::<f32>()
            .map(|f| Val::F32(f.to_bits()))
            .map_err(|_| parse_failure("f32")),
        ValType::F64 => raw
            .parse::<f64>()
            .map(|f| Val::F64(f.to_bits()))
            .map_err(|_| parse_failure("f64")),
        other => Err(SupervisorError::Invocation(format!(
            "unsupported parameter type {}",
            other
        ))),
    }
}
