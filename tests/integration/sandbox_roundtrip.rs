//! The console engine against a live in-process sandbox backend: real
//! WebSocket transport, real REST calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use url::Url;

use deskline::api::HttpApi;
use deskline::attachment::OutgoingFile;
use deskline::config::{ReconnectConfig, SyncConfig};
use deskline::connection::ConnectionRegistry;
use deskline::engine::{Intent, Snapshot, SyncEngine};
use deskline::notify::NoticeKind;
use deskline::transport::ScopeKey;
use deskline::transport::ws::WsConnector;
use deskline_proto::conversation::{Conversation, ConversationStatus, CustomerId, Platform};
use deskline_proto::message::{DeliveryStatus, Direction, MessageKey, MessageType};
use deskline_sandbox::server::{SandboxState, start_server};

const WAIT: Duration = Duration::from_secs(10);
const PROJECT: &str = "acme";

struct Session {
    state: Arc<SandboxState>,
    addr: std::net::SocketAddr,
    registry: ConnectionRegistry<WsConnector>,
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<Snapshot>,
    engine: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Start a sandbox holding `conversations` named after the given
    /// customers, and a console connected to it.
    async fn start(customers: &[&str]) -> (Self, Vec<Conversation>) {
        let state = Arc::new(SandboxState::new(false));
        let mut created = Vec::new();
        for name in customers {
            created.push(
                state
                    .store
                    .create_conversation(PROJECT, Platform::Webchat, name, ConversationStatus::Active)
                    .await,
            );
        }
        let (addr, _server) = start_server("127.0.0.1:0", Arc::clone(&state)).await.unwrap();

        let ws_url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let registry = ConnectionRegistry::new(
            WsConnector::new(ws_url, Duration::from_secs(5)),
            ReconnectConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                max_attempts: 5,
            },
        );
        let connection = registry.connect(&ScopeKey::new(PROJECT));
        let api = Arc::new(HttpApi::new(format!("http://{addr}/api")));
        let (engine, snapshots) = SyncEngine::new(connection, Arc::clone(&api), api, &SyncConfig::default());
        let (intents, intent_rx) = mpsc::channel(16);
        let engine = tokio::spawn(engine.run(intent_rx));

        let session = Self {
            state,
            addr,
            registry,
            intents,
            snapshots,
            engine,
        };
        (session, created)
    }

    async fn intent(&self, intent: Intent) {
        self.intents.send(intent).await.unwrap();
    }

    async fn until(&mut self, what: &str, pred: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        tokio::time::timeout(WAIT, self.snapshots.wait_for(pred))
            .await
            .unwrap_or_else(|_| panic!("snapshot never reached: {what}"))
            .unwrap()
            .clone()
    }

    async fn shutdown(self) {
        self.intent(Intent::Shutdown).await;
        tokio::time::timeout(WAIT, self.engine).await.unwrap().unwrap();
        assert!(self.registry.disconnect(&ScopeKey::new(PROJECT)));
    }
}

#[tokio::test]
async fn conversation_lifecycle_over_websocket() {
    let (mut session, created) = Session::start(&["Ada Lovelace"]).await;
    let ada = created[0].id;

    let snapshot = session
        .until("list loaded", |s| s.connection.connected && s.conversations.len() == 1)
        .await;
    assert_eq!(snapshot.conversations[0].display_name, "Ada Lovelace");
    assert_eq!(session.state.socket_count(PROJECT).await, 1);

    session.intent(Intent::Select(Some(ada))).await;
    session
        .until("conversation open", |s| s.active == Some(ada) && !s.messages_loading)
        .await;

    // Outgoing text: pending, then confirmed by the server.
    session.intent(Intent::SendText("Hello Ada".into())).await;
    let snapshot = session
        .until("text confirmed", |s| {
            s.messages
                .iter()
                .any(|m| m.status == DeliveryStatus::Done && matches!(m.key, MessageKey::Confirmed(_)))
        })
        .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content.as_deref(), Some("Hello Ada"));

    // Customer reply arrives live.
    session
        .state
        .customer_message(PROJECT, ada, "Hi! Quick question")
        .await
        .unwrap();
    let snapshot = session
        .until("reply received", |s| s.messages.len() == 2)
        .await;
    assert_eq!(snapshot.messages[1].direction, Direction::Incoming);
    assert_eq!(snapshot.messages[1].content.as_deref(), Some("Hi! Quick question"));
    assert_eq!(
        snapshot.conversations[0]
            .last_message
            .as_ref()
            .and_then(|m| m.content.as_deref()),
        Some("Hi! Quick question")
    );

    // Link, then close, over REST.
    session
        .intent(Intent::LinkCustomer {
            conversation: ada,
            customer: CustomerId::new(900),
        })
        .await;
    let snapshot = session
        .until("customer linked", |s| {
            s.notice.as_ref().is_some_and(|n| n.message == "Customer linked")
        })
        .await;
    assert_eq!(snapshot.conversations[0].customer_id, Some(CustomerId::new(900)));

    session.intent(Intent::CloseConversation(ada)).await;
    let snapshot = session
        .until("conversation closed", |s| {
            s.notice.as_ref().is_some_and(|n| n.message == "Conversation closed")
        })
        .await;
    assert_eq!(snapshot.conversations[0].status, ConversationStatus::Closed);

    // Closing twice is refused by the server and rolled back to the
    // server's state.
    session.intent(Intent::CloseConversation(ada)).await;
    let snapshot = session
        .until("second close refused", |s| {
            s.notice.as_ref().is_some_and(|n| n.kind == NoticeKind::Failure)
        })
        .await;
    assert_eq!(
        snapshot.notice.unwrap().message,
        "Conversation is already closed"
    );
    assert_eq!(snapshot.conversations[0].status, ConversationStatus::Closed);

    session.shutdown().await;
}

#[tokio::test]
async fn attachment_is_uploaded_and_announced() {
    let (mut session, created) = Session::start(&["Grace Hopper"]).await;
    let grace = created[0].id;

    session
        .until("list loaded", |s| s.conversations.len() == 1)
        .await;
    session.intent(Intent::Select(Some(grace))).await;
    session
        .until("conversation open", |s| s.active == Some(grace) && !s.messages_loading)
        .await;

    let bytes = b"quarterly numbers".to_vec();
    session
        .intent(Intent::SendAttachment(OutgoingFile::new(
            "report.txt",
            "text/plain",
            bytes.clone(),
        )))
        .await;

    let snapshot = session
        .until("attachment confirmed", |s| {
            !s.uploading && s.messages.first().is_some_and(|m| m.status == DeliveryStatus::Done)
        })
        .await;
    let message = &snapshot.messages[0];
    assert_eq!(message.message_type, MessageType::File);
    assert_eq!(
        message.attachment.as_ref().map(|a| a.file_name.as_str()),
        Some("report.txt")
    );

    let served = reqwest::get(format!("http://{}/files/u1/report.txt", session.addr))
        .await
        .unwrap();
    assert!(served.status().is_success());
    assert_eq!(served.bytes().await.unwrap().as_ref(), bytes.as_slice());

    session.shutdown().await;
}

#[tokio::test]
async fn server_disconnect_is_reported_and_recovered() {
    let (mut session, _) = Session::start(&["Alan Turing"]).await;
    session
        .until("online", |s| s.connection.connected && s.conversations.len() == 1)
        .await;

    session
        .state
        .disconnect_project(PROJECT, "maintenance")
        .await;
    let snapshot = session
        .until("disconnect noticed", |s| s.notice.is_some())
        .await;
    assert_eq!(
        snapshot.notice.unwrap().message,
        "disconnected: maintenance"
    );

    // The connection comes back on its own and the list is reloaded.
    session
        .until("reconnected", |s| s.connection.connected && s.conversations.len() == 1)
        .await;

    session.shutdown().await;
}
