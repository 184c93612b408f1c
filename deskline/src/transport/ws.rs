//! WebSocket transport to the live backend.
//!
//! Implements the [`Transport`] trait over a WebSocket connection. Each frame
//! is one JSON text message. A background reader task forwards incoming text
//! frames into a channel and flips `connected` off when the socket ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, ScopeKey, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameter that carries the scope on the handshake URL.
const SCOPE_PARAM: &str = "project";

/// WebSocket transport implementing the [`Transport`] trait.
///
/// Created via [`WsTransport::connect`], which establishes the connection and
/// spawns a background reader task.
pub struct WsTransport {
    /// The backend URL (ws:// or wss://).
    url: String,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Channel for frames received by the background reader task.
    incoming: Mutex<mpsc::Receiver<String>>,
    /// Whether the WebSocket connection is active.
    connected: Arc<AtomicBool>,
    /// Handle to the background reader task (kept alive for the transport's lifetime).
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect to the backend at `url`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the connection is not up within `timeout`.
    /// - [`TransportError::Unreachable`] if the host refuses the connection.
    /// - [`TransportError::Handshake`] if the server rejects the upgrade.
    /// - [`TransportError::Io`] for other socket or TLS failures.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(url, "WebSocket connected");

        Ok(Self {
            url: url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            _reader_handle: reader_handle,
        })
    }

    /// Return the URL this transport is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "WebSocket close failed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Background task that reads WebSocket messages and forwards text frames.
///
/// Binary frames that hold valid UTF-8 are forwarded as text; anything else
/// is logged and skipped. Sets `connected` to `false` when the socket closes
/// or errors out.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<String>, connected: Arc<AtomicBool>) {
    while let Some(msg_result) = ws_reader.next().await {
        let frame = match msg_result {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(err = %e, "non-UTF-8 binary frame, skipping");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        };
        if tx.send(frame).await.is_err() {
            // Receiver dropped; the transport is gone.
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => {
            TransportError::Handshake(format!("HTTP status {}", response.status()))
        }
        WsError::Url(e) => TransportError::Handshake(format!("bad URL: {e}")),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}

/// [`Connector`] that opens a [`WsTransport`] per scope.
///
/// The scope is passed to the backend as the `project` query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for the backend at `base_url`.
    #[must_use]
    pub const fn new(base_url: Url, connect_timeout: Duration) -> Self {
        Self {
            base_url,
            connect_timeout,
        }
    }

    /// The handshake URL used for `scope`.
    #[must_use]
    pub fn scoped_url(&self, scope: &ScopeKey) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair(SCOPE_PARAM, scope.as_str());
        url
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, scope: &ScopeKey) -> Result<WsTransport, TransportError> {
        let url = self.scoped_url(scope);
        WsTransport::connect(url.as_str(), self.connect_timeout).await
    }
}
