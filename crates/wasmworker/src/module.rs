//! # Module Facade
//!
//! Owns one wasmtime instance of an asyncify-instrumented core module: its
//! imported memory, the `env` imports, WASI preview 1 and the bridge state.
//!
//! The facade is synchronous apart from `async_call`, which is the only
//! entry point that lets an export suspend on a storage lookup.

use std::sync::Arc;

use wasmtime::AsContext;
use wasmtime::AsContextMut;
use wasmtime::Caller;
use wasmtime::Engine;
use wasmtime::Extern;
use wasmtime::Func;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Memory;
use wasmtime::MemoryType;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::Val;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1;
use wasmtime_wasi::p1::WasiP1Ctx;
use workrpc::ErrorKind;
use workrpc::RemoteError;

use crate::asyncify;
use crate::asyncify::AsyncCallState;
use crate::asyncify::Host;
use crate::asyncify::Phase;
use crate::config::ModuleConfig;
use crate::env;
use crate::env::EnvHost;
use crate::store::DataStore;

#[derive(Debug)]
pub enum Error {
    Compile(wasmtime::Error),
    Link(wasmtime::Error),
    Instantiate(wasmtime::Error),
    NotInitialized,
    AlreadyInitialized,
    ExportNotFound(String),
    OutOfBounds { start: u64, end: u64, size: usize },
    Trap(wasmtime::Error),
    Bridge(asyncify::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "Compile error: {}", e),
            Self::Link(e) => write!(f, "Link error: {}", e),
            Self::Instantiate(e) => write!(f, "Instantiation error: {}", e),
            Self::NotInitialized => write!(f, "Module not initialized"),
            Self::AlreadyInitialized => write!(f, "Module already initialized"),
            Self::ExportNotFound(name) => write!(f, "Export not found: {}", name),
            Self::OutOfBounds { start, end, size } => {
                write!(f, "Memory range {}..{} out of bounds (size {})", start, end, size)
            }
            Self::Trap(e) => write!(f, "Wasm trap: {:#}", e),
            Self::Bridge(e) => write!(f, "Async bridge error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<asyncify::Error> for Error {
    fn from(e: asyncify::Error) -> Self {
        match e {
            asyncify::Error::Module(e) => Self::Trap(e),
            e => Self::Bridge(e),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Trap(_) => ErrorKind::Trapped,
            Error::Bridge(asyncify::Error::Host(_)) => ErrorKind::Host,
            Error::Bridge(_) => ErrorKind::Bridge,
            Error::OutOfBounds { .. } | Error::ExportNotFound(_) => ErrorKind::BadArguments,
            _ => ErrorKind::Internal,
        };
        RemoteError::new(kind, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-store state reachable from host imports.
struct ModuleCtx {
    bridge: AsyncCallState,
    data_store: Arc<dyn DataStore>,
    logger_name: String,
    malloc_export: String,
    memory: Option<Memory>,
    wasi: WasiP1Ctx,
}

struct Loaded {
    store: Store<ModuleCtx>,
    instance: Instance,
    memory: Memory,
}

impl Loaded {
    fn host(&mut self) -> StoreHost<'_> {
        StoreHost {
            store: &mut self.store,
            instance: self.instance,
            memory: self.memory,
        }
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }
}

/// A compiled module, instantiated by `init`.
pub struct WasmModule {
    engine: Engine,
    module: Module,
    data_store: Arc<dyn DataStore>,
    config: ModuleConfig,
    loaded: Option<Loaded>,
}

impl WasmModule {
    /// Compiles `code`, which may be a binary module or WAT text.
    pub fn new(code: &[u8], data_store: Arc<dyn DataStore>, config: ModuleConfig) -> Result<Self> {
        let engine = Engine::default();
        let module = Module::new(&engine, code).map_err(Error::Compile)?;
        Ok(Self {
            engine,
            module,
            data_store,
            config,
            loaded: None,
        })
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.loaded.is_some()
    }

    /// Instantiates the module with a fresh memory of `initial` pages that
    /// may grow to `maximum` pages.
    ///
    /// Runs `_initialize` when the module exports it, then sets up the
    /// asyncify data region when the module is instrumented.
    pub fn init(&mut self, initial: u32, maximum: u32) -> Result<()> {
        if self.loaded.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let mut wasi = WasiCtxBuilder::new();
        if self.config.inherit_stdio {
            wasi.inherit_stdio();
        }
        let ctx = ModuleCtx {
            bridge: AsyncCallState::new(),
            data_store: self.data_store.clone(),
            logger_name: self.config.logger_name.clone(),
            malloc_export: self.config.malloc_export.clone(),
            memory: None,
            wasi: wasi.build_p1(),
        };
        let mut store = Store::new(&self.engine, ctx);

        let imported = Memory::new(&mut store, MemoryType::new(initial, Some(maximum))).map_err(Error::Link)?;
        let mut linker: Linker<ModuleCtx> = Linker::new(&self.engine);
        p1::add_to_linker_sync(&mut linker, |ctx: &mut ModuleCtx| &mut ctx.wasi).map_err(Error::Link)?;
        linker.define(&mut store, "env", "memory", imported).map_err(Error::Link)?;
        link_env(&mut linker).map_err(Error::Link)?;

        let instance = linker.instantiate(&mut store, &self.module).map_err(Error::Instantiate)?;
        // a module that defines its own memory exports it instead
        let memory = instance.get_memory(&mut store, "memory").unwrap_or(imported);
        store.data_mut().memory = Some(memory);

        let mut loaded = Loaded { store, instance, memory };
        if loaded.has_export("_initialize") {
            loaded.host().call("_initialize", &[]).map_err(Error::Trap)?;
        }
        if loaded.has_export(asyncify::START_UNWIND) {
            AsyncCallState::init(&mut loaded.host(), &self.config.malloc_export, self.config.asyncify_data_size)?;
        }

        tracing::info!(
            logger = %self.config.logger_name,
            initial,
            maximum,
            asyncify = loaded.store.data().bridge.data_addr().is_some(),
            "module initialized"
        );
        self.loaded = Some(loaded);
        Ok(())
    }

    /// Calls an export synchronously.
    ///
    /// An import that needs to suspend fails the call with `NotDriven`.
    pub fn call(&mut self, name: &str, args: &[u32]) -> Result<u32> {
        let loaded = self.export(name)?;
        loaded.host().call(name, args).map_err(|e| asyncify::Error::from_trap(e).into())
    }

    /// Calls an export that may suspend on host imports.
    pub async fn async_call(&mut self, name: &str, args: &[u32]) -> Result<u32> {
        let loaded = self.export(name)?;
        let result = AsyncCallState::call(&mut loaded.host(), name, args).await?;
        Ok(result)
    }

    /// Copies `start..end` out of linear memory.
    pub fn get_memory_slice(&mut self, start: u32, end: u32) -> Result<Vec<u8>> {
        let loaded = self.loaded()?;
        let data = loaded.memory.data(&loaded.store);
        data.get(start as usize..end as usize)
            .map(<[u8]>::to_vec)
            .ok_or(Error::OutOfBounds {
                start: start.into(),
                end: end.into(),
                size: data.len(),
            })
    }

    /// Copies `bytes` into linear memory at `offset`.
    pub fn write_memory(&mut self, bytes: &[u8], offset: u32) -> Result<()> {
        let loaded = self.loaded()?;
        let size = loaded.memory.data_size(&loaded.store);
        loaded.memory.write(&mut loaded.store, offset as usize, bytes).map_err(|_| Error::OutOfBounds {
            start: offset.into(),
            end: u64::from(offset) + bytes.len() as u64,
            size,
        })
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&mut self) -> Result<usize> {
        let loaded = self.loaded()?;
        Ok(loaded.memory.data_size(&loaded.store))
    }

    /// Reads a NUL-terminated string at `addr`.
    pub fn get_memory_as_string(&mut self, addr: u32) -> Result<String> {
        let loaded = self.loaded()?;
        env::read_c_string(&mut loaded.host(), addr).map_err(Error::Trap)
    }

    /// Where the bridge stands, or `None` before `init`.
    pub fn bridge_phase(&self) -> Option<Phase> {
        self.loaded.as_ref().map(|loaded| loaded.store.data().bridge.phase())
    }

    /// Frees the asyncify region and drops the instance.
    ///
    /// The region is only freed when no call is in flight; a busy or poisoned
    /// instance is dropped as is.
    pub fn destroy(&mut self) -> Result<()> {
        let Some(mut loaded) = self.loaded.take() else {
            return Ok(());
        };
        let idle = loaded.store.data().bridge.phase() == Phase::Idle;
        if idle && loaded.has_export(&self.config.free_export) {
            AsyncCallState::release(&mut loaded.host(), &self.config.free_export)?;
        }
        tracing::info!(logger = %self.config.logger_name, "module destroyed");
        Ok(())
    }

    fn loaded(&mut self) -> Result<&mut Loaded> {
        self.loaded.as_mut().ok_or(Error::NotInitialized)
    }

    fn export(&mut self, name: &str) -> Result<&mut Loaded> {
        let loaded = self.loaded()?;
        if !loaded.has_export(name) {
            return Err(Error::ExportNotFound(name.to_string()));
        }
        Ok(loaded)
    }
}

fn link_env(linker: &mut Linker<ModuleCtx>) -> wasmtime::Result<()> {
    linker.func_wrap("env", "logstr", |mut caller: Caller<'_, ModuleCtx>, addr: u32| {
        env::logstr(&mut CallerHost { caller: &mut caller }, addr)
    })?;
    linker.func_wrap(
        "env",
        "get_data",
        |mut caller: Caller<'_, ModuleCtx>, key_addr: u32, length_out_addr: u32| {
            env::get_data(&mut CallerHost { caller: &mut caller }, key_addr, length_out_addr)
        },
    )?;
    linker.func_wrap(
        "env",
        "set_data",
        |mut caller: Caller<'_, ModuleCtx>, key_addr: u32, data_addr: u32, length: u32| {
            env::set_data(&mut CallerHost { caller: &mut caller }, key_addr, data_addr, length)
        },
    )?;
    Ok(())
}

/// Calls `func` with i32 arguments, returning its first i32 result or 0.
fn call_func(mut store: impl AsContextMut, func: &Func, args: &[u32]) -> wasmtime::Result<u32> {
    let params: Vec<Val> = args.iter().map(|arg| Val::I32(*arg as i32)).collect();
    let result_count = func.ty(&store).results().len();
    let mut results = vec![Val::I32(0); result_count];
    func.call(&mut store, &params, &mut results)?;
    match results.first() {
        None => Ok(0),
        Some(Val::I32(value)) => Ok(*value as u32),
        Some(_) => Err(wasmtime::Error::msg("export returned a non-i32 result")),
    }
}

fn read_range(memory: &Memory, store: impl AsContext, start: u32, end: u32) -> wasmtime::Result<Vec<u8>> {
    let data = memory.data(&store);
    match data.get(start as usize..end as usize) {
        Some(bytes) => Ok(bytes.to_vec()),
        None => Err(wasmtime::Error::msg(format!(
            "memory range {}..{} out of bounds (size {})",
            start,
            end,
            data.len()
        ))),
    }
}

/// Bridge access for top-level calls.
struct StoreHost<'a> {
    store: &'a mut Store<ModuleCtx>,
    instance: Instance,
    memory: Memory,
}

impl Host for StoreHost<'_> {
    fn read_bytes(&mut self, start: u32, end: u32) -> wasmtime::Result<Vec<u8>> {
        read_range(&self.memory, &*self.store, start, end)
    }

    fn write_bytes(&mut self, bytes: &[u8], offset: u32) -> wasmtime::Result<()> {
        self.memory.write(&mut *self.store, offset as usize, bytes)?;
        Ok(())
    }

    fn memory_size(&mut self) -> usize {
        self.memory.data_size(&*self.store)
    }

    fn call(&mut self, export: &str, args: &[u32]) -> wasmtime::Result<u32> {
        let func = self
            .instance
            .get_func(&mut *self.store, export)
            .ok_or_else(|| wasmtime::Error::msg(format!("export not found: {}", export)))?;
        call_func(&mut *self.store, &func, args)
    }

    fn bridge(&mut self) -> &mut AsyncCallState {
        &mut self.store.data_mut().bridge
    }
}

/// Bridge access from inside a host import.
struct CallerHost<'a, 'b> {
    caller: &'a mut Caller<'b, ModuleCtx>,
}

impl CallerHost<'_, '_> {
    fn memory(&self) -> wasmtime::Result<Memory> {
        self.caller
            .data()
            .memory
            .ok_or_else(|| wasmtime::Error::msg("memory not available"))
    }
}

impl Host for CallerHost<'_, '_> {
    fn read_bytes(&mut self, start: u32, end: u32) -> wasmtime::Result<Vec<u8>> {
        let memory = self.memory()?;
        read_range(&memory, &*self.caller, start, end)
    }

    fn write_bytes(&mut self, bytes: &[u8], offset: u32) -> wasmtime::Result<()> {
        let memory = self.memory()?;
        memory.write(&mut *self.caller, offset as usize, bytes)?;
        Ok(())
    }

    fn memory_size(&mut self) -> usize {
        match self.caller.data().memory {
            Some(memory) => memory.data_size(&*self.caller),
            None => 0,
        }
    }

    fn call(&mut self, export: &str, args: &[u32]) -> wasmtime::Result<u32> {
        let func = self
            .caller
            .get_export(export)
            .and_then(Extern::into_func)
            .ok_or_else(|| wasmtime::Error::msg(format!("export not found: {}", export)))?;
        call_func(&mut *self.caller, &func, args)
    }

    fn bridge(&mut self) -> &mut AsyncCallState {
        &mut self.caller.data_mut().bridge
    }
}

impl EnvHost for CallerHost<'_, '_> {
    fn data_store(&self) -> Arc<dyn DataStore> {
        self.caller.data().data_store.clone()
    }

    fn logger_name(&self) -> &str {
        &self.caller.data().logger_name
    }

    fn malloc_export(&self) -> &str {
        &self.caller.data().malloc_export
    }
}
