//! Transport layer abstraction for Deskline.
//!
//! Defines the [`Transport`] trait that carries JSON text frames between the
//! console and the backend, and the [`Connector`] trait that opens one per
//! scope. Concrete implementations:
//! - [`loopback::LoopbackTransport`]: in-process channel-based transport for testing
//! - [`ws::WsTransport`]: WebSocket transport to the live backend

pub mod loopback;
pub mod ws;

use std::fmt;
use std::future::Future;

/// Key that identifies one live connection (normally a project id).
///
/// All consumers asking for the same scope share one underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Create a scope key from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string form of this scope key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket to the backend.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The backend refused the handshake or answered with a bad URL/status.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport trait for exchanging text frames with the backend.
///
/// The transport never interprets frame contents. Encoding and decoding
/// happen in [`crate::connection`].
pub trait Transport: Send + Sync {
    /// Send one frame.
    ///
    /// Returns `Ok(())` once the frame has been handed to the underlying
    /// socket. Delivery is confirmed only by application-level replies.
    fn send(&self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the peer has gone
    /// away; no further frames will arrive after that.
    fn recv(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Close the transport from the local side.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Check whether the underlying link is still up.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens transports on demand, one per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// Transport produced by this connector.
    type Transport: Transport + 'static;

    /// Establish a new transport for `scope`.
    fn connect(
        &self,
        scope: &ScopeKey,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}
