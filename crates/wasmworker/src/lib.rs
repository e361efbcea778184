//! # wasmworker
//!
//! Runs asyncify-instrumented wasm modules whose host imports are backed by
//! asynchronous storage, and drives them from another context over a
//! message channel.
//!
//! - `asyncify` suspends and resumes a synchronous call stack around an
//!   async host operation.
//! - `module` wraps one wasmtime instance and its `env` imports.
//! - `client`, `server` and `proxy` carry method calls across a `Transport`.
//! - `worker` puts a module on its own thread behind a `WasmWorker` handle.

pub mod asyncify;
pub mod channel;
pub mod client;
pub mod config;
pub mod env;
pub mod module;
pub mod proxy;
pub mod server;
pub mod store;
pub mod transport;
pub mod worker;


pub use channel::ChannelTransport;
pub use config::ClientConfig;
pub use config::ModuleConfig;
pub use config::WorkerConfig;
pub use module::WasmModule;
pub use proxy::ModuleMethod;
pub use proxy::Proxy;
pub use proxy::WasmWorker;
pub use proxy::create_proxy;
pub use server::Dispatch;
pub use server::Dispatcher;
pub use store::DataStore;
pub use store::FileStore;
pub use store::MemoryStore;
pub use transport::Transport;
pub use worker::create_worker;
