//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a connection
//! between the console and a backend. Created via
//! [`LoopbackTransport::create_pair`], which returns two connected endpoints:
//! frames sent on one are received by the other.
//!
//! [`LoopbackConnector`] plugs the pair into a [`crate::connection::Connection`]
//! and hands the backend end of every new pair to the test.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{Connector, ScopeKey, Transport, TransportError, TransportType};

/// In-process transport backed by `tokio::sync::mpsc` channels.
pub struct LoopbackTransport {
    /// Sender for outgoing frames (delivers to the remote's receiver).
    /// Taken on [`close`](Transport::close) so the remote sees end-of-stream.
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    /// Receiver for incoming frames (fed by the remote's sender).
    rx: Mutex<mpsc::Receiver<String>>,
}

impl LoopbackTransport {
    /// Create a pair of connected loopback transports.
    ///
    /// The `buffer` parameter controls the channel capacity for each direction.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use deskline::transport::Transport;
    /// use deskline::transport::loopback::LoopbackTransport;
    ///
    /// # async fn example() {
    /// let (console, backend) = LoopbackTransport::create_pair(32);
    /// console.send(r#"{"event":"ready"}"#.to_string()).await.unwrap();
    /// assert_eq!(backend.recv().await.unwrap(), r#"{"event":"ready"}"#);
    /// # }
    /// ```
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);

        let a = Self {
            tx: parking_lot::Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
        };
        let b = Self {
            tx: parking_lot::Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
        };
        (a, b)
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.lock().clone()
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

/// [`Connector`] that creates a fresh loopback pair per connection attempt.
///
/// The backend end of each pair is delivered on the receiver returned by
/// [`LoopbackConnector::new`], so a test can play the server.
pub struct LoopbackConnector {
    backends: mpsc::UnboundedSender<LoopbackTransport>,
    failures: AtomicUsize,
    buffer: usize,
}

impl LoopbackConnector {
    /// Create a connector and the stream of backend endpoints it produces.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<LoopbackTransport>) {
        let (backends, rx) = mpsc::unbounded_channel();
        let connector = Self {
            backends,
            failures: AtomicUsize::new(0),
            buffer,
        };
        (connector, rx)
    }

    /// Make the next `attempts` connection attempts fail as unreachable.
    pub fn fail_next(&self, attempts: usize) {
        self.failures.store(attempts, Ordering::SeqCst);
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, scope: &ScopeKey) -> Result<LoopbackTransport, TransportError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            tracing::debug!(scope = %scope, "loopback connect refused");
            return Err(TransportError::Unreachable(format!("loopback/{scope}")));
        }

        let (console, backend) = LoopbackTransport::create_pair(self.buffer);
        self.backends
            .send(backend)
            .map_err(|_| TransportError::Unreachable(format!("loopback/{scope}")))?;
        Ok(console)
    }
}
