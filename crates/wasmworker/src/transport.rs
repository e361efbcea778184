//! # Transport Abstraction
//!
//! A minimal, async interface for moving messages between two execution
//! contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about requests, ids or values.
//!   It moves opaque buffers.
//! - **Ordered and Reliable**: Within one channel instance, messages arrive in
//!   send order and are not lost. Nothing is promised across a close.
//! - **Pump-Driven**: `recv` is the `onMessage` side. Whoever owns the receive
//!   half runs a loop over it; correlation lives above this layer.

use std::fmt;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the channel was closed.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A point-to-point, bidirectional message pipe.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a payload to the peer.
    ///
    /// # Invariants
    /// - Must return `Err` once the channel is closed, from either side.
    /// - Must not interpret the payload content.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next payload from the peer.
    ///
    /// Returns `Ok(None)` once the channel is closed, from either side.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes this end of the channel.
    ///
    /// Pending and future `recv` calls on this end return `Ok(None)`; the peer
    /// observes the close as end of stream. Closing twice is a no-op.
    async fn close(&self);
}
