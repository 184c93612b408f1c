//! Live connection manager.
//!
//! A [`Connection`] owns one transport to the backend for a scope and runs a
//! background driver task that:
//!
//! 1. establishes the transport through a [`Connector`],
//! 2. writes queued command frames in the order they were emitted,
//! 3. decodes incoming frames and fans them out to [`Subscription`]s,
//! 4. re-establishes the transport with exponential backoff after an
//!    abnormal disconnect.
//!
//! Connection health is published on a `watch` channel as a
//! [`ConnectionState`]. The [`ConnectionRegistry`] hands out one shared
//! connection per [`ScopeKey`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};

use deskline_proto::codec::{self, CodecError};
use deskline_proto::event::{Command, DisconnectReason, EventKind, ServerEvent};

use crate::config::ReconnectConfig;
use crate::transport::{Connector, ScopeKey, Transport, TransportError};

/// Reason reported when the transport drops underneath us.
const TRANSPORT_CLOSE: &str = "transport close";

/// Errors returned by [`Connection`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection was disconnected or its driver gave up.
    #[error("connection is closed")]
    Closed,

    /// The command could not be encoded.
    #[error("failed to encode command: {0}")]
    Codec(#[from] CodecError),
}

/// Health of a connection as seen by its consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// `true` between a `ready` event and the next disconnect.
    pub connected: bool,
    /// Description of the most recent failure, cleared by `ready` or an
    /// intentional disconnect.
    pub last_error: Option<String>,
    /// Set only when the link itself could not be established or the
    /// driver gave up. Server `error` and `disconnect` events never touch it.
    pub link_error: Option<String>,
}

/// Which server events a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Only the listed kinds.
    Only(Vec<EventKind>),
}

impl EventFilter {
    /// Filter on the given event kinds.
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::Only(kinds.into_iter().collect())
    }

    /// Whether an event of `kind` passes this filter.
    #[must_use]
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: HashMap<u64, (EventFilter, mpsc::UnboundedSender<ServerEvent>)>,
}

impl Subscribers {
    fn insert(&mut self, filter: EventFilter, tx: mpsc::UnboundedSender<ServerEvent>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (filter, tx));
        id
    }

    fn dispatch(&mut self, event: &ServerEvent) {
        let kind = event.kind();
        self.entries.retain(|_, (filter, tx)| {
            if !filter.matches(kind) {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

/// State shared between a [`Connection`] handle, its driver task and its
/// subscriptions.
struct Shared {
    scope: ScopeKey,
    state: watch::Sender<ConnectionState>,
    subscribers: Mutex<Subscribers>,
    shutdown: Notify,
    closing: AtomicBool,
}

impl Shared {
    /// Update connection health from an event, then deliver it.
    ///
    /// The subscriber lock is held throughout so a concurrent
    /// [`Connection::subscribe`] sees either both the state change and the
    /// event, or neither.
    fn apply(&self, event: &ServerEvent) {
        let mut subscribers = self.subscribers.lock();
        match event {
            ServerEvent::Ready => {
                tracing::info!(scope = %self.scope, "connection ready");
                self.state.send_modify(|s| {
                    s.connected = true;
                    s.last_error = None;
                    s.link_error = None;
                });
            }
            ServerEvent::Error(err) => {
                tracing::warn!(scope = %self.scope, error = %err, "server reported error");
                self.state
                    .send_modify(|s| s.last_error = Some(err.to_string()));
            }
            ServerEvent::Disconnect(reason) => {
                tracing::info!(scope = %self.scope, reason = %reason.reason, "disconnected");
                let last_error =
                    (!reason.is_intentional()).then(|| format!("disconnected: {}", reason.reason));
                let intentional = last_error.is_none();
                self.state.send_modify(|s| {
                    s.connected = false;
                    s.last_error = last_error;
                    if intentional {
                        s.link_error = None;
                    }
                });
            }
            _ => {}
        }
        subscribers.dispatch(event);
    }

    fn set_error(&self, message: String) {
        self.state.send_modify(|s| {
            s.connected = false;
            s.last_error = Some(message.clone());
            s.link_error = Some(message);
        });
    }
}

/// A live event stream from a [`Connection`].
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    shared: Weak<Shared>,
    missed_ready: bool,
}

impl Subscription {
    /// Wait for the next matching event.
    ///
    /// Returns `None` once the connection has shut down for good.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    /// Take the next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }

    /// Whether the connection was already up when this subscription was
    /// created, so the current session's `ready` will not be delivered.
    #[must_use]
    pub const fn missed_ready(&self) -> bool {
        self.missed_ready
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.lock().entries.remove(&self.id);
        }
    }
}

/// One live connection to the backend for a scope.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection {
    /// Open a connection for `scope` and start its driver task.
    ///
    /// Returns immediately; establishment happens in the background and
    /// its outcome is visible through [`Connection::state`]. Must be called
    /// from within a tokio runtime.
    pub fn open<C: Connector>(scope: ScopeKey, connector: Arc<C>, policy: ReconnectConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::default());
        let shared = Arc::new(Shared {
            scope,
            state,
            subscribers: Mutex::new(Subscribers::default()),
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(Arc::clone(&shared), connector, policy, outbound_rx));

        Arc::new(Self { shared, outbound })
    }

    /// The scope this connection serves.
    #[must_use]
    pub fn scope(&self) -> &ScopeKey {
        &self.shared.scope
    }

    /// Queue a command for the backend.
    ///
    /// Never blocks. Commands emitted while the transport is down are held
    /// and written once it is re-established.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after [`Connection::disconnect`]
    /// or once reconnection has been abandoned, and
    /// [`ConnectionError::Codec`] if the command cannot be encoded.
    pub fn emit(&self, command: Command) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = codec::encode_command(&command)?;
        tracing::debug!(scope = %self.shared.scope, command = command.name(), "emit");
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Subscribe to server events passing `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.lock();
        let missed_ready = self.shared.state.borrow().connected;
        let id = subscribers.insert(filter, tx);
        Subscription {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
            missed_ready,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().entries.len()
    }

    /// Current connection health.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch connection health changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Close the connection on purpose. Idempotent.
    pub fn disconnect(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            tracing::info!(scope = %self.shared.scope, "disconnect requested");
            self.shared.shutdown.notify_one();
        }
    }

    /// Whether the connection has been closed or abandoned.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }
}

/// How a transport session ended.
enum SessionEnd {
    /// Local close requested (or every [`Connection`] handle dropped).
    Local,
    /// The transport went away. `announced` is set when the server already
    /// sent its own `disconnect` event.
    Lost { reason: String, announced: bool },
}

/// Driver task: establish, pump, and re-establish the transport.
async fn drive<C: Connector>(
    shared: Arc<Shared>,
    connector: Arc<C>,
    policy: ReconnectConfig,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut held: Option<String> = None;
    let mut attempt: u32 = 0;
    let mut intentional = false;

    loop {
        if shared.closing.load(Ordering::SeqCst) {
            intentional = true;
            break;
        }

        let established = tokio::select! {
            result = connector.connect(&shared.scope) => result,
            () = shared.shutdown.notified() => {
                intentional = true;
                break;
            }
        };

        match established {
            Ok(transport) => {
                attempt = 0;
                tracing::info!(
                    scope = %shared.scope,
                    transport = %transport.transport_type(),
                    "transport established"
                );
                match run_session(&shared, &transport, &mut outbound, &mut held).await {
                    SessionEnd::Local => {
                        transport.close().await;
                        intentional = true;
                        break;
                    }
                    SessionEnd::Lost { reason, announced } => {
                        tracing::warn!(scope = %shared.scope, reason = %reason, "transport lost");
                        if !announced {
                            shared.apply(&ServerEvent::Disconnect(DisconnectReason { reason }));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(scope = %shared.scope, err = %e, "connection attempt failed");
                shared.set_error(e.to_string());
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            tracing::error!(
                scope = %shared.scope,
                attempts = policy.max_attempts,
                "giving up on reconnecting"
            );
            shared.set_error(format!(
                "gave up reconnecting after {} attempts",
                policy.max_attempts
            ));
            break;
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(scope = %shared.scope, attempt, ?delay, "reconnecting after delay");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.shutdown.notified() => {
                intentional = true;
                break;
            }
        }
    }

    shared.closing.store(true, Ordering::SeqCst);
    if intentional {
        shared.apply(&ServerEvent::Disconnect(DisconnectReason::client()));
    }
    // Ends every subscription stream.
    shared.subscribers.lock().entries.clear();
    tracing::debug!(scope = %shared.scope, "connection driver exiting");
}

/// Pump one established transport until it ends.
async fn run_session<T: Transport>(
    shared: &Shared,
    transport: &T,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    held: &mut Option<String>,
) -> SessionEnd {
    // A frame whose write failed in the previous session goes first.
    if let Some(frame) = held.take()
        && let Err(e) = transport.send(frame.clone()).await
    {
        *held = Some(frame);
        return lost(&e);
    }

    loop {
        tokio::select! {
            incoming = transport.recv() => match incoming {
                Ok(frame) => match codec::decode_event(&frame) {
                    Ok(ServerEvent::Disconnect(reason)) => {
                        shared.apply(&ServerEvent::Disconnect(reason.clone()));
                        return SessionEnd::Lost { reason: reason.reason, announced: true };
                    }
                    Ok(event) => shared.apply(&event),
                    Err(e) => {
                        tracing::warn!(scope = %shared.scope, err = %e, "malformed frame, skipping");
                    }
                },
                Err(e) => return lost(&e),
            },
            next = outbound.recv() => match next {
                Some(frame) => {
                    if let Err(e) = transport.send(frame.clone()).await {
                        *held = Some(frame);
                        return lost(&e);
                    }
                }
                None => return SessionEnd::Local,
            },
            () = shared.shutdown.notified() => return SessionEnd::Local,
        }
    }
}

fn lost(err: &TransportError) -> SessionEnd {
    let reason = match err {
        TransportError::ConnectionClosed => TRANSPORT_CLOSE.to_string(),
        other => format!("transport error: {other}"),
    };
    SessionEnd::Lost {
        reason,
        announced: false,
    }
}

/// Keeps one shared [`Connection`] per scope.
pub struct ConnectionRegistry<C: Connector> {
    connector: Arc<C>,
    policy: ReconnectConfig,
    connections: Mutex<HashMap<ScopeKey, Arc<Connection>>>,
}

impl<C: Connector> ConnectionRegistry<C> {
    /// Create a registry that opens transports with `connector`.
    pub fn new(connector: C, policy: ReconnectConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            policy,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection for `scope`, opening one if needed.
    pub fn connect(&self, scope: &ScopeKey) -> Arc<Connection> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(scope)
            && !existing.is_closed()
        {
            tracing::debug!(scope = %scope, "reusing connection");
            return Arc::clone(existing);
        }

        tracing::info!(scope = %scope, "opening connection");
        let connection = Connection::open(
            scope.clone(),
            Arc::clone(&self.connector),
            self.policy.clone(),
        );
        connections.insert(scope.clone(), Arc::clone(&connection));
        connection
    }

    /// The live connection for `scope`, if any.
    pub fn get(&self, scope: &ScopeKey) -> Option<Arc<Connection>> {
        self.connections.lock().get(scope).cloned()
    }

    /// Tear down the connection for `scope`. Returns `false` if none existed.
    pub fn disconnect(&self, scope: &ScopeKey) -> bool {
        let removed = self.connections.lock().remove(scope);
        removed.is_some_and(|connection| {
            connection.disconnect();
            true
        })
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
