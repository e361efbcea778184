//! # Worker Bootstrap
//!
//! Runs a `WasmModule` on its own OS thread with a private current-thread
//! runtime, so a long synchronous export never blocks the controller. The
//! two sides share nothing but a `ChannelTransport` pair.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::channel::ChannelTransport;
use crate::client;
use crate::config::WorkerConfig;
use crate::module;
use crate::module::WasmModule;
use crate::proxy::WasmWorker;
use crate::server::Dispatcher;
use crate::store::DataStore;
use crate::transport::Transport;

#[derive(Debug)]
pub enum Error {
    Spawn(std::io::Error),
    Runtime(std::io::Error),
    Module(module::Error),
    /// The worker thread went away before reporting readiness.
    Exited,
    Client(client::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "Failed to spawn worker thread: {}", e),
            Self::Runtime(e) => write!(f, "Failed to build worker runtime: {}", e),
            Self::Module(e) => write!(f, "Failed to load module: {}", e),
            Self::Exited => write!(f, "Worker exited before it was ready"),
            Self::Client(e) => write!(f, "Worker client error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<module::Error> for Error {
    fn from(e: module::Error) -> Self {
        Self::Module(e)
    }
}

impl From<client::Error> for Error {
    fn from(e: client::Error) -> Self {
        Self::Client(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Starts a worker for `code` and returns a connected, initialised handle.
///
/// Compile failures are reported here rather than on the first call.
/// Dropping the handle without `destroy_worker` closes the connection; the
/// worker then tears the module down and its thread exits.
pub async fn create_worker(
    code: impl Into<Vec<u8>>,
    data_store: Arc<dyn DataStore>,
    config: WorkerConfig,
) -> Result<WasmWorker> {
    let code = code.into();
    let (controller, worker_end) = ChannelTransport::pair();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    let thread_name = config.thread_name.clone();
    let module_config = config.module.clone();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(Error::Runtime(e)));
                    return;
                }
            };

            runtime.block_on(async move {
                let module = match WasmModule::new(&code, data_store, module_config) {
                    Ok(module) => module,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Module(e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let transport: Arc<dyn Transport> = Arc::new(worker_end);
                match Dispatcher::new(thread_name.clone(), module, transport).serve().await {
                    Ok(shutdown) => tracing::debug!(worker = %thread_name, ?shutdown, "worker stopped"),
                    Err(e) => tracing::warn!(worker = %thread_name, error = %e, "worker stopped on transport error"),
                }
            });
        })
        .map_err(Error::Spawn)?;

    ready_rx.await.map_err(|_| Error::Exited)??;

    let worker = WasmWorker::connect(Box::new(controller), config.client)?;
    worker
        .init(config.module.initial_pages, config.module.maximum_pages)
        .await?;
    tracing::info!(worker = %config.thread_name, "worker ready");
    Ok(worker)
}
