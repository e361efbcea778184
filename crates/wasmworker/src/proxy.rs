//! # Dispatch Proxy
//!
//! Presents a remote object's methods as local async calls.
//!
//! `Proxy` is the untyped layer: a declared method table over a
//! `DispatchClient`. `WasmWorker` is the typed proxy for a `WasmModule`
//! living on the other end, and `ModuleMethod` is the table both sides agree
//! on.

use std::collections::HashSet;
use std::vec;

use workrpc::DESTROY_METHOD;
use workrpc::RemoteError;
use workrpc::Value;

use crate::client;
use crate::client::DispatchClient;
use crate::client::Error;
use crate::config::ClientConfig;
use crate::config::DEFAULT_INITIAL_PAGES;
use crate::config::DEFAULT_MAXIMUM_PAGES;
use crate::module::WasmModule;
use crate::server::Dispatch;
use crate::transport::Transport;

/// A method table bound to a transport.
pub struct Proxy {
    client: DispatchClient,
    methods: HashSet<String>,
}

/// Builds a proxy accepting exactly `methods`.
///
/// Fails with `ReservedMethod` if the table names the destroy command.
pub fn create_proxy<I, S>(methods: I, transport: Box<dyn Transport>, config: ClientConfig) -> client::Result<Proxy>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Proxy::new("proxy", methods, transport, config)
}

impl Proxy {
    pub fn new<I, S>(
        name: impl Into<String>,
        methods: I,
        transport: Box<dyn Transport>,
        config: ClientConfig,
    ) -> client::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods: HashSet<String> = methods.into_iter().map(Into::into).collect();
        if methods.contains(DESTROY_METHOD) {
            return Err(Error::ReservedMethod(DESTROY_METHOD.to_string()));
        }
        Ok(Self {
            client: DispatchClient::new(name, transport, config),
            methods,
        })
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn client(&self) -> &DispatchClient {
        &self.client
    }

    /// Invokes a declared method. Undeclared names never reach the wire.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> client::Result<Value> {
        if method == DESTROY_METHOD {
            return Err(Error::ReservedMethod(method.to_string()));
        }
        if !self.has_method(method) {
            return Err(Error::UnknownMethod(method.to_string()));
        }
        self.client.request(method, args).await
    }

    /// Asks the far side to tear down, then closes this end.
    ///
    /// The transport is closed even when the acknowledgement never arrives;
    /// the acknowledgement's outcome is returned.
    pub async fn destroy(&self) -> client::Result<()> {
        let timeout = self.client.config().destroy_timeout;
        let outcome = self
            .client
            .request_with_timeout(DESTROY_METHOD, Vec::new(), Some(timeout))
            .await;
        self.client.close().await;
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(client = %self.client.name(), error = %e, "destroy not acknowledged");
                Err(e)
            }
        }
    }
}

/// The methods a `WasmModule` exposes across a worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleMethod {
    Init,
    Call,
    AsyncCall,
    GetMemorySlice,
    WriteMemory,
}

impl ModuleMethod {
    pub const ALL: [ModuleMethod; 5] = [
        Self::Init,
        Self::Call,
        Self::AsyncCall,
        Self::GetMemorySlice,
        Self::WriteMemory,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Call => "call",
            Self::AsyncCall => "async_call",
            Self::GetMemorySlice => "get_memory_slice",
            Self::WriteMemory => "write_memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.name() == name)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::ALL.into_iter().map(|method| method.name())
    }
}

/// Controller-side handle to a `WasmModule` running in a worker.
pub struct WasmWorker {
    proxy: Proxy,
}

impl WasmWorker {
    pub fn connect(transport: Box<dyn Transport>, config: ClientConfig) -> client::Result<Self> {
        let proxy = Proxy::new("wasm-worker", ModuleMethod::names(), transport, config)?;
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn init(&self, initial_pages: u32, maximum_pages: u32) -> client::Result<()> {
        let args = vec![Value::U32(initial_pages), Value::U32(maximum_pages)];
        self.invoke(ModuleMethod::Init, args).await.and_then(expect_unit(ModuleMethod::Init))
    }

    pub async fn call(&self, name: &str, args: &[u32]) -> client::Result<u32> {
        let result = self.invoke(ModuleMethod::Call, export_args(name, args)).await?;
        expect_u32(ModuleMethod::Call, result)
    }

    pub async fn async_call(&self, name: &str, args: &[u32]) -> client::Result<u32> {
        let result = self.invoke(ModuleMethod::AsyncCall, export_args(name, args)).await?;
        expect_u32(ModuleMethod::AsyncCall, result)
    }

    pub async fn get_memory_slice(&self, start: u32, end: u32) -> client::Result<Vec<u8>> {
        let result = self
            .invoke(ModuleMethod::GetMemorySlice, vec![Value::U32(start), Value::U32(end)])
            .await?;
        match result {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected(ModuleMethod::GetMemorySlice, &other)),
        }
    }

    pub async fn write_memory(&self, bytes: &[u8], offset: u32) -> client::Result<()> {
        let args = vec![Value::Bytes(bytes.to_vec()), Value::U32(offset)];
        self.invoke(ModuleMethod::WriteMemory, args)
            .await
            .and_then(expect_unit(ModuleMethod::WriteMemory))
    }

    /// Destroys the remote module and closes the connection.
    pub async fn destroy_worker(&self) -> client::Result<()> {
        self.proxy.destroy().await
    }

    async fn invoke(&self, method: ModuleMethod, args: Vec<Value>) -> client::Result<Value> {
        self.proxy.call(method.name(), args).await
    }
}

fn export_args(name: &str, args: &[u32]) -> Vec<Value> {
    let mut values = Vec::with_capacity(args.len() + 1);
    values.push(Value::from(name));
    values.extend(args.iter().copied().map(Value::U32));
    values
}

fn unexpected(method: ModuleMethod, found: &Value) -> Error {
    Error::UnexpectedResult {
        method: method.name().to_string(),
        found: found.desc(),
    }
}

fn expect_u32(method: ModuleMethod, value: Value) -> client::Result<u32> {
    value.as_u32().ok_or_else(|| unexpected(method, &value))
}

fn expect_unit(method: ModuleMethod) -> impl FnOnce(Value) -> client::Result<()> {
    move |value| match value {
        Value::Unit => Ok(()),
        other => Err(unexpected(method, &other)),
    }
}

/// Positional argument reader for the worker side.
struct Args {
    method: ModuleMethod,
    values: vec::IntoIter<Value>,
}

impl Args {
    fn new(method: ModuleMethod, values: Vec<Value>) -> Self {
        Self {
            method,
            values: values.into_iter(),
        }
    }

    fn mismatch(&self, expected: &str, found: Option<&Value>) -> RemoteError {
        let found = found.map(Value::desc).unwrap_or("nothing");
        RemoteError::bad_arguments(format!("{}: expected {}, got {}", self.method.name(), expected, found))
    }

    fn u32(&mut self) -> Result<u32, RemoteError> {
        match self.values.next() {
            Some(Value::U32(v)) => Ok(v),
            other => Err(self.mismatch("u32", other.as_ref())),
        }
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, RemoteError> {
        match self.values.next() {
            None | Some(Value::Unit) => Ok(None),
            Some(Value::U32(v)) => Ok(Some(v)),
            other => Err(self.mismatch("u32 or unit", other.as_ref())),
        }
    }

    fn string(&mut self) -> Result<String, RemoteError> {
        match self.values.next() {
            Some(Value::String(s)) => Ok(s),
            other => Err(self.mismatch("string", other.as_ref())),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, RemoteError> {
        match self.values.next() {
            Some(Value::Bytes(b)) => Ok(b),
            other => Err(self.mismatch("bytes", other.as_ref())),
        }
    }

    fn rest_u32(&mut self) -> Result<Vec<u32>, RemoteError> {
        let mut rest = Vec::new();
        while self.values.len() > 0 {
            rest.push(self.u32()?);
        }
        Ok(rest)
    }

    fn finish(mut self) -> Result<(), RemoteError> {
        match self.values.next() {
            None => Ok(()),
            extra => Err(self.mismatch("no more arguments", extra.as_ref())),
        }
    }
}

#[async_trait::async_trait]
impl Dispatch for WasmModule {
    async fn dispatch(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let Some(method) = ModuleMethod::from_name(method) else {
            return Err(RemoteError::method_not_found(method));
        };
        let mut args = Args::new(method, args);

        match method {
            ModuleMethod::Init => {
                let initial = args.opt_u32()?.unwrap_or(DEFAULT_INITIAL_PAGES);
                let maximum = args.opt_u32()?.unwrap_or(DEFAULT_MAXIMUM_PAGES);
                args.finish()?;
                self.init(initial, maximum)?;
                Ok(Value::Unit)
            }
            ModuleMethod::Call => {
                let name = args.string()?;
                let rest = args.rest_u32()?;
                Ok(Value::U32(self.call(&name, &rest)?))
            }
            ModuleMethod::AsyncCall => {
                let name = args.string()?;
                let rest = args.rest_u32()?;
                Ok(Value::U32(self.async_call(&name, &rest).await?))
            }
            ModuleMethod::GetMemorySlice => {
                let start = args.u32()?;
                let end = args.u32()?;
                args.finish()?;
                Ok(Value::Bytes(self.get_memory_slice(start, end)?))
            }
            ModuleMethod::WriteMemory => {
                let bytes = args.bytes()?;
                let offset = args.u32()?;
                args.finish()?;
                self.write_memory(&bytes, offset)?;
                Ok(Value::Unit)
            }
        }
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(error = %e, "module teardown failed");
        }
    }
}
