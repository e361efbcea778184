//! In-process channel transport.
//!
//! Connects a controller and a worker living in the same process (on
//! different threads or tasks) with a pair of unbounded tokio channels.

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via `send()` appear on the peer's `recv()` and vice versa.
/// Closing either end ends the stream on both.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl ChannelTransport {
    /// Creates a new transport from separate tx and rx channels.
    pub fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: watch::Sender::new(false),
        }
    }

    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::ConnectionLost("Channel closed".into()));
        }
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| transport::Error::ConnectionLost("Peer closed".into())),
            None => Err(transport::Error::ConnectionLost("Channel closed".into())),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => Ok(msg),
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Ok(None),
        }
    }

    async fn close(&self) {
        // wake a pending recv first so it gives up the receiver lock
        self.closed.send_replace(true);
        self.tx.lock().await.take();
        self.rx.lock().await.close();
    }
}
