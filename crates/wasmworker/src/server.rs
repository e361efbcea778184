//! # Dispatch Server
//!
//! The worker side of a connection: decodes requests, hands them to a
//! `Dispatch` target one at a time and writes back one response per request.
//!
//! The reserved destroy command is handled here rather than by the target:
//! the target gets a chance to release its resources, the command is
//! acknowledged, and the transport is closed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use workrpc::DESTROY_METHOD;
use workrpc::DispatchRequest;
use workrpc::DispatchResponse;
use workrpc::ErrorKind;
use workrpc::Frame;
use workrpc::RemoteError;
use workrpc::Value;

use crate::transport;
use crate::transport::Transport;

/// An object whose methods can be invoked by name over a transport.
#[async_trait::async_trait]
pub trait Dispatch: Send + 'static {
    async fn dispatch(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RemoteError>;

    /// Called once when the destroy command arrives, before it is acknowledged.
    async fn teardown(&mut self) {}
}

/// How a served connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The destroy command was received and acknowledged.
    Destroyed,
    /// The peer closed the transport.
    PeerClosed,
}

/// Serves one `Dispatch` target over one transport.
pub struct Dispatcher<D> {
    name: String,
    target: D,
    transport: Arc<dyn Transport>,
}

impl<D: Dispatch> Dispatcher<D> {
    pub fn new(name: impl Into<String>, target: D, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            target,
            transport,
        }
    }

    pub fn target(&self) -> &D {
        &self.target
    }

    /// Processes requests until the destroy command arrives or the peer
    /// goes away. Requests are handled strictly in arrival order.
    pub async fn serve(mut self) -> transport::Result<Shutdown> {
        tracing::debug!(worker = %self.name, "serving");
        loop {
            let Some(msg) = self.transport.recv().await? else {
                tracing::debug!(worker = %self.name, "peer closed");
                self.target.teardown().await;
                return Ok(Shutdown::PeerClosed);
            };

            let request = match Frame::decode(&msg) {
                Ok(Frame::Request(request)) => request,
                Ok(Frame::Response(response)) => {
                    tracing::warn!(worker = %self.name, id = response.id, "ignoring response frame");
                    continue;
                }
                Err(e) => {
                    reject_undecodable(&self.name, &*self.transport, &msg, e).await?;
                    continue;
                }
            };

            if request.method == DESTROY_METHOD {
                tracing::info!(worker = %self.name, "destroy requested");
                self.target.teardown().await;
                let ack = DispatchResponse::ok(request.id, Value::Unit);
                let sent = respond(&*self.transport, &ack).await;
                self.transport.close().await;
                sent?;
                return Ok(Shutdown::Destroyed);
            }

            let response = self.handle(request).await;
            respond(&*self.transport, &response).await?;
        }
    }

    async fn handle(&mut self, request: DispatchRequest) -> DispatchResponse {
        let DispatchRequest { id, method, args } = request;
        tracing::trace!(worker = %self.name, id, method = %method, "dispatch");

        let outcome = AssertUnwindSafe(self.target.dispatch(&method, args))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(worker = %self.name, method = %method, "handler panicked: {}", message);
                Err(RemoteError::new(ErrorKind::Panicked, message))
            });

        if let Err(e) = &outcome {
            tracing::debug!(worker = %self.name, id, method = %method, error = %e, "request failed");
        }
        DispatchResponse { id, outcome }
    }
}

/// Answers a request whose body could not be decoded, when its id can
/// still be recovered. Otherwise the message is dropped.
async fn reject_undecodable(
    name: &str,
    transport: &dyn Transport,
    msg: &[u8],
    e: workrpc::Error,
) -> transport::Result<()> {
    match workrpc::decode_id(msg) {
        Ok(id) => {
            tracing::warn!(worker = %name, id, error = %e, "undecodable request");
            let response = DispatchResponse::err(id, RemoteError::new(ErrorKind::Protocol, e.to_string()));
            respond(transport, &response).await
        }
        Err(_) => {
            tracing::warn!(worker = %name, error = %e, "dropping unreadable message");
            Ok(())
        }
    }
}

async fn respond(transport: &dyn Transport, response: &DispatchResponse) -> transport::Result<()> {
    let bytes = match response.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            // the value itself was unencodable; report that instead
            let fallback = DispatchResponse::err(response.id, RemoteError::new(ErrorKind::Internal, e.to_string()));
            fallback.to_bytes().map_err(|e| transport::Error::Io(e.to_string()))?
        }
    };
    transport.send(&bytes).await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
