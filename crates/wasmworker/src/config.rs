//! # Configuration
//!
//! Builder-style settings for the module facade, the dispatch client and the
//! worker bootstrap. Every field has a working default.

use std::time::Duration;

/// 20 pages by default. 20 * 2^16 > 1MiB stack plus other overheads.
pub const DEFAULT_INITIAL_PAGES: u32 = 20;

/// 8192 pages by default, i.e. 512MiB.
pub const DEFAULT_MAXIMUM_PAGES: u32 = 8192;

/// Size of the region the module unwinds its stack into.
pub const DEFAULT_ASYNCIFY_DATA_SIZE: u32 = 16 * 1024;

/// Settings for a `WasmModule`.
#[derive(Clone, Debug)]
pub struct ModuleConfig {
    pub initial_pages: u32,
    pub maximum_pages: u32,
    /// Value of the `logger` field on every line the module logs.
    pub logger_name: String,
    pub asyncify_data_size: u32,
    /// Export used to allocate inside the module.
    pub malloc_export: String,
    /// Export used to free memory allocated with `malloc_export`.
    pub free_export: String,
    /// Whether WASI stdio is wired to the host process.
    pub inherit_stdio: bool,
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self {
            initial_pages: DEFAULT_INITIAL_PAGES,
            maximum_pages: DEFAULT_MAXIMUM_PAGES,
            logger_name: "wasm".to_string(),
            asyncify_data_size: DEFAULT_ASYNCIFY_DATA_SIZE,
            malloc_export: "bbmalloc".to_string(),
            free_export: "bbfree".to_string(),
            inherit_stdio: false,
        }
    }

    pub fn pages(mut self, initial: u32, maximum: u32) -> Self {
        self.initial_pages = initial;
        self.maximum_pages = maximum;
        self
    }

    pub fn logger_name(mut self, name: impl Into<String>) -> Self {
        self.logger_name = name.into();
        self
    }

    pub fn asyncify_data_size(mut self, size: u32) -> Self {
        self.asyncify_data_size = size;
        self
    }

    pub fn allocator(mut self, malloc: impl Into<String>, free: impl Into<String>) -> Self {
        self.malloc_export = malloc.into();
        self.free_export = free.into();
        self
    }

    pub fn inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for a `DispatchClient`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Upper bound on how long one request waits for its response.
    /// `None` waits until the response arrives or the transport closes.
    pub request_timeout: Option<Duration>,
    /// How long the destroy command waits for its acknowledgement before the
    /// client closes its end regardless.
    pub destroy_timeout: Duration,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            request_timeout: None,
            destroy_timeout: Duration::from_secs(30),
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for `create_worker`.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub module: ModuleConfig,
    pub client: ClientConfig,
    pub thread_name: String,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            module: ModuleConfig::new(),
            client: ClientConfig::new(),
            thread_name: "wasm-worker".to_string(),
        }
    }

    pub fn module(mut self, f: impl FnOnce(ModuleConfig) -> ModuleConfig) -> Self {
        self.module = f(self.module);
        self
    }

    pub fn client(mut self, f: impl FnOnce(ClientConfig) -> ClientConfig) -> Self {
        self.client = f(self.client);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}
