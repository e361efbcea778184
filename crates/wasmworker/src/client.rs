//! # Dispatch Client
//!
//! The controller side of a worker connection. Requests are correlated to
//! responses by id through a pending table; a background pump demultiplexes
//! everything the transport delivers.
//!
//! When the transport ends, for whatever reason, the pump marks the client
//! closed and rejects every request still waiting. A request issued after
//! that fails immediately instead of waiting forever.
//!
//! Dropping the client stops the pump, which closes the transport so the
//! peer sees the connection end.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use workrpc::DispatchRequest;
use workrpc::Frame;
use workrpc::RemoteError;
use workrpc::Value;

use crate::config::ClientConfig;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Wire(String),
    Remote(RemoteError),
    /// The transport closed before a response arrived.
    ConnectionClosed,
    Timeout,
    /// The method is not in the proxy's table; nothing was sent.
    UnknownMethod(String),
    /// The reserved destroy command was used as an ordinary method.
    ReservedMethod(String),
    /// The response carried a value of the wrong shape.
    UnexpectedResult { method: String, found: &'static str },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(msg) => write!(f, "Wire error: {}", msg),
            Self::Remote(e) => write!(f, "Remote failure: {}", e),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::UnknownMethod(name) => write!(f, "Unknown method: {}", name),
            Self::ReservedMethod(name) => write!(f, "Reserved method name: {}", name),
            Self::UnexpectedResult { method, found } => {
                write!(f, "Unexpected result for {}: got {}", method, found)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<workrpc::Error> for Error {
    fn from(e: workrpc::Error) -> Self {
        Self::Wire(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type PendingTable = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// Id-correlated request client over a `Transport`.
///
/// Requests may be issued concurrently from many tasks; responses are
/// matched by id in whatever order they arrive.
pub struct DispatchClient {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    stop_pump: Option<oneshot::Sender<()>>,
    config: ClientConfig,
}

impl DispatchClient {
    /// Creates a client and spawns its pump on the current tokio runtime.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, config: ClientConfig) -> Self {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let pump_name = name.clone();
        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_closed = closed.clone();
        let (stop_pump, mut stopped) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let error = loop {
                let received = tokio::select! {
                    received = pump_transport.recv() => received,
                    _ = &mut stopped => {
                        tracing::debug!(client = %pump_name, "client dropped");
                        break Error::ConnectionClosed;
                    }
                };
                match received {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&msg, &pump_pending) {
                            tracing::error!(client = %pump_name, error = %e, "dropping connection");
                            break e;
                        }
                    }
                    Ok(None) => break Error::ConnectionClosed,
                    Err(e) => {
                        tracing::error!(client = %pump_name, error = %e, "transport error in pump");
                        break Error::Transport(e);
                    }
                }
            };

            // set before draining so no request can slip in behind the drain
            pump_closed.store(true, Ordering::SeqCst);
            pump_transport.close().await;
            let rejected = Self::notify_all_pending(&pump_pending, error);
            tracing::debug!(client = %pump_name, rejected, "pump stopped");
        });

        Self {
            name,
            transport,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            stop_pump: Some(stop_pump),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sends `method(args)` and waits for its response, bounded by the
    /// configured request timeout.
    pub async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.request_with_timeout(method, args, self.config.request_timeout).await
    }

    /// Like `request`, with an explicit bound.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = DispatchRequest::new(id, method, args).to_bytes()?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // the pump may have drained between the first check and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(Error::ConnectionClosed);
        }

        tracing::trace!(client = %self.name, id, method, "request");
        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&id);
            return Err(match e {
                transport::Error::ConnectionLost(_) => Error::ConnectionClosed,
                e => Error::Transport(e),
            });
        }

        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.pending.remove(&id);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        match response {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Closes the transport. Outstanding requests are rejected by the pump.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Routes one incoming frame to its waiter.
    fn handle_message(msg: &[u8], pending: &PendingTable) -> Result<()> {
        let Frame::Response(response) = Frame::decode(msg)? else {
            return Err(Error::Wire("client received a request frame".into()));
        };

        // late or duplicate responses have no waiter
        let Some((_, tx)) = pending.remove(&response.id) else {
            tracing::debug!(id = response.id, "response without a pending request");
            return Ok(());
        };

        let _ = tx.send(response.outcome.map_err(Error::Remote));
        Ok(())
    }

    /// Rejects every waiter with `error`, returning how many there were.
    fn notify_all_pending(pending: &PendingTable, error: Error) -> usize {
        let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }
}

impl Drop for DispatchClient {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_pump.take() {
            let _ = stop.send(());
        }
    }
}
