//! End-to-end tests of the sync engine's event loop.
//!
//! The engine runs as a task over a loopback connection; each test plays the
//! backend by reading commands and pushing events, and observes the engine
//! only through its published snapshots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use deskline::api::{ApiError, ConsoleApi};
use deskline::attachment::{OutgoingFile, UploadService, UploadTarget};
use deskline::config::{ReconnectConfig, SyncConfig};
use deskline::connection::Connection;
use deskline::engine::{Intent, Snapshot, SyncEngine};
use deskline::notify::NoticeKind;
use deskline::transport::loopback::{LoopbackConnector, LoopbackTransport};
use deskline::transport::{ScopeKey, Transport};
use deskline_proto::codec;
use deskline_proto::conversation::{
    Conversation, ConversationFilter, ConversationId, ConversationStatus, CustomerId, Platform,
};
use deskline_proto::event::{
    Command, ConversationPage, ConversationRef, Cursor, MessagePage, NewMessage, SendResult, ServerEvent,
};
use deskline_proto::message::{
    DeliveryStatus, Direction, MessageId, MessageKey, MessageRecord, MessageType, Timestamp,
};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    fail_with: Option<&'static str>,
}

impl ConsoleApi for FakeApi {
    async fn close_conversation(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        if let Some(message) = self.fail_with {
            return Err(ApiError::Status {
                status: 409,
                message: Some(message.to_string()),
            });
        }
        Ok(conv(id.get(), ConversationStatus::Closed, 100))
    }

    async fn link_customer(&self, id: ConversationId, customer: CustomerId) -> Result<Conversation, ApiError> {
        let mut c = conv(id.get(), ConversationStatus::Active, 100);
        c.customer_id = Some(customer);
        Ok(c)
    }
}

#[derive(Default)]
struct FakeUploads {
    fail_destination: bool,
}

impl UploadService for FakeUploads {
    async fn request_destination(&self, file_name: &str, _mime: &str) -> Result<UploadTarget, ApiError> {
        if self.fail_destination {
            return Err(ApiError::Status {
                status: 500,
                message: None,
            });
        }
        Ok(UploadTarget {
            upload_url: format!("https://upload.test/{file_name}"),
            file_url: format!("https://cdn.test/{file_name}"),
        })
    }

    async fn upload(&self, _target: &UploadTarget, _bytes: Vec<u8>, _mime: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn conv(id: i64, status: ConversationStatus, at: i64) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        platform: Platform::Instagram,
        external_id: format!("ig-{id}"),
        display_name: format!("Customer {id}"),
        status,
        unread_count: 0,
        last_activity_at: Timestamp::from_millis(at),
        last_message: None,
        customer_id: None,
    }
}

fn incoming(id: i64, conversation: i64, at: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        message_type: MessageType::Text,
        direction: Direction::Incoming,
        status: DeliveryStatus::Done,
        content: Some(format!("message {id}")),
        file_url: None,
        file_name: None,
        file_type: None,
        file_size: None,
        thumbnail_url: None,
        sent_at: Timestamp::from_millis(at),
        created_at: None,
        temp_message_id: None,
    }
}

fn page(conversations: Vec<Conversation>, next: Option<&str>) -> ServerEvent {
    ServerEvent::ConversationsList(ConversationPage {
        has_more: next.is_some(),
        next_cursor: next.map(Cursor::new),
        conversations,
    })
}

struct Console {
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<Snapshot>,
    backend: LoopbackTransport,
    backends: mpsc::UnboundedReceiver<LoopbackTransport>,
    connection: Arc<Connection>,
    engine: JoinHandle<()>,
}

impl Console {
    /// Start an engine and complete the first handshake; the initial
    /// `getConversations` has been consumed.
    async fn start(api: FakeApi, uploads: FakeUploads) -> Self {
        let (connector, mut backends) = LoopbackConnector::new(64);
        let policy = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: 5,
        };
        let connection = Connection::open(ScopeKey::new("acme"), Arc::new(connector), policy);
        let backend = tokio::time::timeout(WAIT, backends.recv())
            .await
            .unwrap()
            .unwrap();

        let config = SyncConfig {
            notification_duration: Duration::from_millis(300),
            ..SyncConfig::default()
        };
        let (engine, snapshots) = SyncEngine::new(
            Arc::clone(&connection),
            Arc::new(api),
            Arc::new(uploads),
            &config,
        );
        let (intents, intent_rx) = mpsc::channel(16);
        let engine = tokio::spawn(engine.run(intent_rx));

        let mut console = Self {
            intents,
            snapshots,
            backend,
            backends,
            connection,
            engine,
        };
        console.push(&ServerEvent::Ready).await;
        let Command::GetConversations(query) = console.command().await else {
            panic!("expected the initial getConversations");
        };
        assert_eq!(query.limit, 20);
        console.until("online", |s| s.connection.connected).await;
        console
    }

    async fn intent(&self, intent: Intent) {
        self.intents.send(intent).await.unwrap();
    }

    async fn push(&self, event: &ServerEvent) {
        self.backend
            .send(codec::encode_event(event).unwrap())
            .await
            .unwrap();
    }

    async fn command(&self) -> Command {
        let frame = tokio::time::timeout(WAIT, self.backend.recv())
            .await
            .expect("no command emitted")
            .unwrap();
        codec::decode_command(&frame).unwrap()
    }

    async fn assert_quiet(&self) {
        let frame = tokio::time::timeout(Duration::from_millis(100), self.backend.recv()).await;
        assert!(frame.is_err(), "unexpected command: {frame:?}");
    }

    async fn until(&mut self, what: &str, pred: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        tokio::time::timeout(WAIT, self.snapshots.wait_for(pred))
            .await
            .unwrap_or_else(|_| panic!("snapshot never reached: {what}"))
            .unwrap()
            .clone()
    }

    /// List `conversations` and open conversation `id` with an empty history.
    async fn open(&mut self, conversations: Vec<Conversation>, id: i64) {
        self.push(&page(conversations, None)).await;
        self.until("list loaded", |s| !s.conversations.is_empty()).await;

        self.intent(Intent::Select(Some(ConversationId::new(id)))).await;
        let Command::GetMessages(query) = self.command().await else {
            panic!("expected getMessages");
        };
        assert_eq!(query.conversation_id, ConversationId::new(id));
        assert_eq!(
            self.command().await,
            Command::MarkMessagesRead(ConversationRef {
                conversation_id: ConversationId::new(id)
            })
        );
        self.push(&ServerEvent::MessagesList(MessagePage {
            conversation_id: ConversationId::new(id),
            messages: Vec::new(),
            next_cursor: None,
            has_more: false,
        }))
        .await;
        self.until("conversation open", |s| {
            s.active == Some(ConversationId::new(id)) && !s.messages_loading
        })
        .await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_more_merges_without_duplicates() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;

    console
        .intent(Intent::SetFilter(ConversationFilter::with_status(ConversationStatus::Active)))
        .await;
    let Command::GetConversations(query) = console.command().await else {
        panic!("expected getConversations");
    };
    assert_eq!(query.status, Some(ConversationStatus::Active));
    assert_eq!(query.limit, 20);
    assert!(query.cursor.is_none());

    // The reply to the unfiltered startup request lands late and is dropped.
    console
        .push(&page(vec![conv(9, ConversationStatus::Closed, 900)], Some("stale")))
        .await;
    console
        .push(&page(
            vec![
                conv(2, ConversationStatus::Active, 300),
                conv(1, ConversationStatus::Active, 200),
            ],
            Some("1"),
        ))
        .await;
    console.until("first page", |s| s.conversations.len() == 2).await;

    console.intent(Intent::LoadMoreConversations).await;
    let Command::GetConversations(query) = console.command().await else {
        panic!("expected getConversations");
    };
    assert_eq!(query.cursor, Some(Cursor::new("1")));

    // A second load-more while the first is in flight is dropped.
    console.intent(Intent::LoadMoreConversations).await;
    console.assert_quiet().await;

    console
        .push(&page(
            vec![
                conv(1, ConversationStatus::Active, 200),
                conv(3, ConversationStatus::Active, 100),
            ],
            None,
        ))
        .await;
    let snapshot = console
        .until("second page", |s| !s.conversations_loading && s.conversations.len() == 3)
        .await;
    let ids: Vec<i64> = snapshot.conversations.iter().map(|c| c.id.get()).collect();
    assert_eq!(ids, vec![2, 1, 3]);
    assert!(!snapshot.has_more_conversations);

    console.intent(Intent::LoadMoreConversations).await;
    console.assert_quiet().await;
}

#[tokio::test]
async fn send_text_confirms_exactly_once() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    console
        .open(vec![conv(42, ConversationStatus::Active, 10)], 42)
        .await;

    console.intent(Intent::SendText("hello".into())).await;
    let Command::SendMessage(send) = console.command().await else {
        panic!("expected sendMessage");
    };
    assert_eq!(send.conversation_id, ConversationId::new(42));
    assert_eq!(send.content.as_deref(), Some("hello"));

    let pending = console.until("pending message", |s| s.messages.len() == 1).await;
    assert_eq!(pending.messages[0].status, DeliveryStatus::Pending);
    assert_eq!(pending.messages[0].direction, Direction::Outgoing);

    console
        .push(&ServerEvent::MessageResult(SendResult {
            success: true,
            temp_message_id: Some(send.temp_message_id),
            message_id: Some(MessageId::new(999)),
            sent_at: None,
            error: None,
            message: None,
        }))
        .await;
    let mut echo = incoming(999, 42, 20);
    echo.direction = Direction::Outgoing;
    echo.content = Some("hello".into());
    echo.temp_message_id = Some(send.temp_message_id);
    console
        .push(&ServerEvent::NewMessage(NewMessage {
            message: echo,
            conversation: None,
        }))
        .await;

    let confirmed = console
        .until("confirmed", |s| {
            s.messages
                .first()
                .is_some_and(|m| m.key == MessageKey::Confirmed(MessageId::new(999)))
        })
        .await;
    assert_eq!(confirmed.messages.len(), 1);
    assert_eq!(confirmed.messages[0].status, DeliveryStatus::Done);
    assert_eq!(
        confirmed.conversations[0]
            .last_message
            .as_ref()
            .and_then(|m| m.content.as_deref()),
        Some("hello")
    );
}

#[tokio::test]
async fn failed_destination_marks_attachment_failed() {
    let uploads = FakeUploads {
        fail_destination: true,
    };
    let mut console = Console::start(FakeApi::default(), uploads).await;
    console
        .open(vec![conv(42, ConversationStatus::Active, 10)], 42)
        .await;

    console
        .intent(Intent::SendAttachment(OutgoingFile::new(
            "photo.png",
            "image/png",
            vec![0; 16],
        )))
        .await;

    let snapshot = console
        .until("attachment failed", |s| {
            !s.uploading && s.messages.first().is_some_and(|m| m.status == DeliveryStatus::Failed)
        })
        .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].message_type, MessageType::Image);
    let notice = snapshot.notice.unwrap();
    assert_eq!(notice.kind, NoticeKind::Failure);
    assert_eq!(
        notice.message,
        "could not prepare upload: The request could not be completed"
    );
    // Nothing was announced.
    console.assert_quiet().await;
}

#[tokio::test]
async fn filter_change_clears_excluded_selection() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    console
        .open(vec![conv(42, ConversationStatus::Active, 10)], 42)
        .await;

    console
        .intent(Intent::SetFilter(ConversationFilter::with_status(ConversationStatus::Closed)))
        .await;
    let snapshot = console
        .until("selection cleared", |s| s.active.is_none())
        .await;
    assert!(snapshot.messages.is_empty());

    let Command::GetConversations(query) = console.command().await else {
        panic!("expected getConversations");
    };
    assert_eq!(query.status, Some(ConversationStatus::Closed));
    console.push(&page(vec![conv(8, ConversationStatus::Closed, 5)], None)).await;
    let snapshot = console
        .until("closed list", |s| s.conversations.len() == 1 && !s.conversations_loading)
        .await;
    assert_eq!(snapshot.conversations[0].id, ConversationId::new(8));
    assert_eq!(snapshot.active, None);
}

#[tokio::test]
async fn unread_resets_after_read_receipt() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    console
        .open(
            vec![
                conv(42, ConversationStatus::Active, 50),
                conv(7, ConversationStatus::Active, 40),
            ],
            42,
        )
        .await;

    console
        .push(&ServerEvent::NewMessage(NewMessage {
            message: incoming(11, 7, 60),
            conversation: None,
        }))
        .await;
    let snapshot = console
        .until("unread counted", |s| {
            s.conversations.iter().any(|c| c.id == ConversationId::new(7) && c.unread_count == 1)
        })
        .await;
    assert_eq!(snapshot.conversations[0].id, ConversationId::new(7));

    console
        .push(&ServerEvent::MessagesMarkedRead(ConversationRef {
            conversation_id: ConversationId::new(7),
        }))
        .await;
    console
        .until("unread reset", |s| s.conversations.iter().all(|c| c.unread_count == 0))
        .await;
}

#[tokio::test]
async fn reconnect_resyncs_list_and_history() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    console
        .open(vec![conv(42, ConversationStatus::Active, 10)], 42)
        .await;

    console.backend.close().await;
    let snapshot = console
        .until("offline", |s| !s.connection.connected && s.notice.is_some())
        .await;
    assert_eq!(
        snapshot.notice.map(|n| n.message).as_deref(),
        Some("disconnected: transport close")
    );

    console.backend = tokio::time::timeout(WAIT, console.backends.recv())
        .await
        .unwrap()
        .unwrap();
    console.push(&ServerEvent::Ready).await;

    assert_eq!(console.command().await.name(), "getConversations");
    let Command::GetMessages(query) = console.command().await else {
        panic!("expected getMessages");
    };
    assert_eq!(query.conversation_id, ConversationId::new(42));
    assert!(query.cursor.is_none());
    assert_eq!(console.command().await.name(), "markMessagesRead");
    console.until("online", |s| s.connection.connected).await;
}

#[tokio::test]
async fn rejected_close_rolls_back() {
    let api = FakeApi {
        fail_with: Some("Conversation is already closed"),
    };
    let mut console = Console::start(api, FakeUploads::default()).await;
    console
        .open(vec![conv(42, ConversationStatus::Active, 10)], 42)
        .await;

    console
        .intent(Intent::CloseConversation(ConversationId::new(42)))
        .await;
    let snapshot = console
        .until("rolled back", |s| s.notice.is_some())
        .await;
    assert_eq!(snapshot.conversations[0].status, ConversationStatus::Active);
    assert_eq!(
        snapshot.notice.unwrap().message,
        "Conversation is already closed"
    );

    // The notice expires on its own.
    console.until("notice expired", |s| s.notice.is_none()).await;
}

#[tokio::test]
async fn deep_link_to_customer_opens_when_listed() {
    let mut console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    console.intent(Intent::OpenCustomer(CustomerId::new(500))).await;

    let mut linked = conv(77, ConversationStatus::Active, 10);
    linked.customer_id = Some(CustomerId::new(500));
    console
        .push(&page(vec![conv(1, ConversationStatus::Active, 20), linked], None))
        .await;

    console
        .until("deep link applied", |s| s.active == Some(ConversationId::new(77)))
        .await;
    assert_eq!(console.command().await.name(), "getMessages");
}

#[tokio::test]
async fn shutdown_releases_subscription() {
    let console = Console::start(FakeApi::default(), FakeUploads::default()).await;
    assert_eq!(console.connection.subscriber_count(), 1);

    console.intent(Intent::Shutdown).await;
    tokio::time::timeout(WAIT, console.engine).await.unwrap().unwrap();
    assert_eq!(console.connection.subscriber_count(), 0);

    console.connection.disconnect();
    let mut state = console.connection.watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| !s.connected))
        .await
        .unwrap()
        .unwrap();
}
