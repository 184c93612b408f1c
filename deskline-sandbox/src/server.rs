//! Sandbox server: WebSocket protocol handler, per-project socket registry,
//! and the REST routes the console calls.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /ws?project=…` | live protocol |
//! | `POST /api/conversations/{id}/close` | close a conversation |
//! | `PUT /api/conversations/{id}/customer` | link a customer |
//! | `POST /api/uploads` | reserve an upload slot |
//! | `PUT /upload/{key}` | upload sink |
//! | `GET /files/{key}/{name}` | serve an uploaded file |
//!
//! Replies to a command go to the socket that sent it; `newMessage`,
//! `conversation` and `messagesMarkedRead` go to every socket of the
//! project.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

use deskline_proto::codec;
use deskline_proto::conversation::{Conversation, ConversationId, CustomerId};
use deskline_proto::event::{
    Command, ConversationPush, DisconnectReason, NewMessage, ProtocolError, SendResult, ServerEvent,
};

use crate::store::{SandboxStore, StoreError};

type SocketSender = mpsc::UnboundedSender<Message>;

/// Shared server state: the store plus every live socket by project.
pub struct SandboxState {
    pub store: SandboxStore,
    sockets: RwLock<HashMap<String, HashMap<u64, SocketSender>>>,
    next_socket: AtomicU64,
    public_url: OnceLock<String>,
}

impl SandboxState {
    #[must_use]
    pub fn new(seed: bool) -> Self {
        Self {
            store: SandboxStore::new(seed),
            sockets: RwLock::new(HashMap::new()),
            next_socket: AtomicU64::new(1),
            public_url: OnceLock::new(),
        }
    }

    /// Fix the base URL used in upload and file links. Only the first call
    /// has an effect.
    pub fn set_public_url(&self, url: &str) {
        let _ = self.public_url.set(url.trim_end_matches('/').to_string());
    }

    fn public_url(&self) -> &str {
        self.public_url.get().map_or("", String::as_str)
    }

    async fn register(&self, project: &str, sender: SocketSender) -> u64 {
        let id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let mut sockets = self.sockets.write().await;
        sockets.entry(project.to_string()).or_default().insert(id, sender);
        id
    }

    async fn unregister(&self, project: &str, id: u64) {
        let mut sockets = self.sockets.write().await;
        if let Some(project_sockets) = sockets.get_mut(project) {
            project_sockets.remove(&id);
            if project_sockets.is_empty() {
                sockets.remove(project);
            }
        }
    }

    /// Number of live sockets for a project.
    pub async fn socket_count(&self, project: &str) -> usize {
        self.sockets.read().await.get(project).map_or(0, HashMap::len)
    }

    /// Send an event to every socket of a project.
    pub async fn broadcast(&self, project: &str, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        let sockets = self.sockets.read().await;
        for sender in sockets.get(project).into_iter().flat_map(HashMap::values) {
            let _ = sender.send(Message::Text(frame.clone().into()));
        }
    }

    /// Simulate a customer writing to a conversation.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownConversation`] if the project has no such conversation.
    pub async fn customer_message(
        &self,
        project: &str,
        id: ConversationId,
        content: &str,
    ) -> Result<(), StoreError> {
        let (record, conversation) = self.store.receive_message(project, id, content).await?;
        self.broadcast(
            project,
            &ServerEvent::NewMessage(NewMessage {
                message: record,
                conversation: Some(conversation),
            }),
        )
        .await;
        Ok(())
    }

    /// Announce a server-side disconnect to a project's sockets, then close them.
    pub async fn disconnect_project(&self, project: &str, reason: &str) {
        self.broadcast(
            project,
            &ServerEvent::Disconnect(DisconnectReason {
                reason: reason.to_string(),
            }),
        )
        .await;
        self.close_project(project).await;
    }

    /// Send a close frame to every socket of a project.
    pub async fn close_project(&self, project: &str) {
        let sockets = self.sockets.read().await;
        for (id, sender) in sockets.get(project).into_iter().flat_map(HashMap::iter) {
            tracing::info!(project, socket = id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    codec::encode_event(event)
        .inspect_err(|e| tracing::error!(error = %e, "failed to encode event"))
        .ok()
}

fn reply(sender: &SocketSender, event: &ServerEvent) {
    if let Some(frame) = encode(event) {
        let _ = sender.send(Message::Text(frame.into()));
    }
}

fn protocol_error(code: &str, message: impl Into<String>) -> ServerEvent {
    ServerEvent::Error(ProtocolError {
        code: Some(code.to_string()),
        message: message.into(),
    })
}

/// Handles an upgraded WebSocket for one project.
///
/// Sends `ready`, then answers commands until either side closes.
pub async fn handle_socket(socket: WebSocket, project: String, state: Arc<SandboxState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let socket_id = state.register(&project, tx.clone()).await;
    tracing::info!(project = %project, socket = socket_id, "socket connected");

    reply(&tx, &ServerEvent::Ready);

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_project = project.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(&reader_project, &tx, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(project = %reader_project, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(&project, socket_id).await;
    tracing::info!(project = %project, socket = socket_id, "socket disconnected");
}

async fn handle_frame(project: &str, sender: &SocketSender, frame: &str, state: &SandboxState) {
    let command = match codec::decode_command(frame) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(project, error = %e, "invalid frame");
            reply(sender, &protocol_error("bad_request", e.to_string()));
            return;
        }
    };
    tracing::debug!(project, command = command.name(), "command");

    match command {
        Command::GetConversations(query) => {
            let page = state.store.list_conversations(project, &query).await;
            reply(sender, &ServerEvent::ConversationsList(page));
        }
        Command::GetMessages(query) => match state.store.list_messages(project, &query).await {
            Ok(page) => reply(sender, &ServerEvent::MessagesList(page)),
            Err(e) => reply(sender, &protocol_error("not_found", e.to_string())),
        },
        Command::SendMessage(send) => match state.store.send_message(project, &send).await {
            Ok((record, conversation)) => {
                reply(
                    sender,
                    &ServerEvent::MessageResult(SendResult {
                        success: true,
                        temp_message_id: Some(send.temp_message_id),
                        message_id: Some(record.id),
                        sent_at: Some(record.sent_at),
                        error: None,
                        message: None,
                    }),
                );
                state
                    .broadcast(
                        project,
                        &ServerEvent::NewMessage(NewMessage {
                            message: record,
                            conversation: None,
                        }),
                    )
                    .await;
                state
                    .broadcast(project, &ServerEvent::Conversation(ConversationPush { conversation }))
                    .await;
            }
            Err(e) => {
                tracing::info!(project, temp = %send.temp_message_id, reason = %e, "send rejected");
                reply(
                    sender,
                    &ServerEvent::MessageResult(SendResult {
                        success: false,
                        temp_message_id: Some(send.temp_message_id),
                        message_id: None,
                        sent_at: None,
                        error: Some(e.to_string()),
                        message: None,
                    }),
                );
            }
        },
        Command::MarkMessagesRead(target) => match state.store.mark_read(project, target.conversation_id).await {
            Ok(_) => {
                state
                    .broadcast(project, &ServerEvent::MessagesMarkedRead(target))
                    .await;
            }
            Err(e) => reply(sender, &protocol_error("not_found", e.to_string())),
        },
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

/// REST failure with a `{message}` body.
struct ApiFailure(StatusCode, String);

impl From<StoreError> for ApiFailure {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::UnknownConversation(_) | StoreError::UnknownUpload(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyClosed | StoreError::ConversationClosed => StatusCode::CONFLICT,
            StoreError::EmptyContent => StatusCode::BAD_REQUEST,
        };
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "message": self.1 }))).into_response()
    }
}

#[derive(Deserialize)]
struct WsParams {
    project: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkCustomerBody {
    customer_id: CustomerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    file_name: String,
    file_type: String,
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<SandboxState>>,
) -> Response {
    let Some(project) = params.project.filter(|p| !p.is_empty()) else {
        return ApiFailure(StatusCode::BAD_REQUEST, "project is required".to_string()).into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, project, state))
}

async fn close_conversation(
    State(state): State<Arc<SandboxState>>,
    Path(id): Path<i64>,
) -> Result<Json<Conversation>, ApiFailure> {
    let (project, conversation) = state.store.close_conversation(ConversationId::new(id)).await?;
    tracing::info!(project = %project, conversation = id, "conversation closed");
    state
        .broadcast(
            &project,
            &ServerEvent::Conversation(ConversationPush {
                conversation: conversation.clone(),
            }),
        )
        .await;
    Ok(Json(conversation))
}

async fn link_customer(
    State(state): State<Arc<SandboxState>>,
    Path(id): Path<i64>,
    Json(body): Json<LinkCustomerBody>,
) -> Result<Json<Conversation>, ApiFailure> {
    let (project, conversation) = state
        .store
        .link_customer(ConversationId::new(id), body.customer_id)
        .await?;
    state
        .broadcast(
            &project,
            &ServerEvent::Conversation(ConversationPush {
                conversation: conversation.clone(),
            }),
        )
        .await;
    Ok(Json(conversation))
}

async fn reserve_upload(
    State(state): State<Arc<SandboxState>>,
    Json(body): Json<UploadBody>,
) -> Json<serde_json::Value> {
    let key = state.store.reserve_upload(&body.file_name, &body.file_type).await;
    let base = state.public_url();
    let name: String = body
        .file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    Json(serde_json::json!({
        "uploadUrl": format!("{base}/upload/{key}"),
        "fileUrl": format!("{base}/files/{key}/{name}"),
    }))
}

async fn receive_upload(
    State(state): State<Arc<SandboxState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiFailure> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let size = body.len();
    state.store.complete_upload(&key, mime, body.to_vec()).await?;
    tracing::info!(key = %key, size, "upload stored");
    Ok(StatusCode::OK)
}

async fn serve_file(
    State(state): State<Arc<SandboxState>>,
    Path((key, _name)): Path<(String, String)>,
) -> Result<Response, ApiFailure> {
    let file = state
        .store
        .upload(&key)
        .await
        .ok_or_else(|| ApiFailure::from(StoreError::UnknownUpload(key.clone())))?;
    let bytes = file.bytes.unwrap_or_default();
    Ok(([(header::CONTENT_TYPE, file.mime_type)], bytes).into_response())
}

/// Build the router for a state.
pub fn router(state: Arc<SandboxState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/api/conversations/{id}/close", axum::routing::post(close_conversation))
        .route("/api/conversations/{id}/customer", axum::routing::put(link_customer))
        .route("/api/uploads", axum::routing::post(reserve_upload))
        .route("/upload/{key}", axum::routing::put(receive_upload))
        .route("/files/{key}/{name}", axum::routing::get(serve_file))
        .with_state(state)
}

/// Starts the sandbox with the given state.
///
/// When the state has no public URL yet, it is set to
/// `http://{bound address}`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    state: Arc<SandboxState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    state.set_public_url(&format!("http://{bound_addr}"));

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "sandbox server error");
        }
    });

    Ok((bound_addr, handle))
}
