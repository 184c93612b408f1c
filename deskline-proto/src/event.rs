//! Commands and server events exchanged over the live connection.
//!
//! Both enums are adjacently tagged: every frame is
//! `{"event": "<camelCaseName>", "data": {...}}`, with `data` omitted for
//! payload-less events such as `ready`.

use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, ConversationId, ConversationStatus, Platform};
use crate::message::{MessageId, MessageRecord, MessageType, TempId, Timestamp};

/// Opaque pagination token returned by list replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a raw cursor value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw cursor value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `getConversations` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsQuery {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `getMessages` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub conversation_id: ConversationId,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `sendMessage` payload. Text sends carry `content`, attachment sends the
/// `file*` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub message_type: MessageType,
    pub temp_message_id: TempId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Payload naming a single conversation (`markMessagesRead`,
/// `messagesMarkedRead`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

/// Commands the console emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Command {
    GetConversations(ConversationsQuery),
    GetMessages(MessagesQuery),
    SendMessage(SendMessage),
    MarkMessagesRead(ConversationRef),
}

impl Command {
    /// Wire name of the command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetConversations(_) => "getConversations",
            Self::GetMessages(_) => "getMessages",
            Self::SendMessage(_) => "sendMessage",
            Self::MarkMessagesRead(_) => "markMessagesRead",
        }
    }
}

/// `conversationsList` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub conversations: Vec<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    #[serde(default)]
    pub has_more: bool,
}

/// `conversation` payload: a single upsert push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPush {
    pub conversation: Conversation,
}

/// `messagesList` payload. Messages are oldest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    #[serde(default)]
    pub has_more: bool,
}

/// `newMessage` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub message: MessageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
}

/// `messageResult` payload: confirmation or rejection of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_message_id: Option<TempId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SendResult {
    /// Human-readable failure reason, preferring `error` over `message`.
    #[must_use]
    pub fn failure_reason(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("message could not be sent")
    }
}

/// `error` payload: protocol-level failure pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// `disconnect` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    pub reason: String,
}

/// Reason reported when the local side closes the connection on purpose.
pub const CLIENT_DISCONNECT: &str = "io client disconnect";

impl DisconnectReason {
    /// Disconnect initiated by this console.
    #[must_use]
    pub fn client() -> Self {
        Self {
            reason: CLIENT_DISCONNECT.to_string(),
        }
    }

    /// Whether the local side closed the connection intentionally.
    #[must_use]
    pub fn is_intentional(&self) -> bool {
        self.reason == CLIENT_DISCONNECT
    }
}

/// Events the server pushes to the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// The connection is usable. Sent again after every reconnect.
    #[serde(alias = "connect")]
    Ready,
    ConversationsList(ConversationPage),
    Conversation(ConversationPush),
    MessagesList(MessagePage),
    NewMessage(NewMessage),
    MessageResult(SendResult),
    MessagesMarkedRead(ConversationRef),
    Error(ProtocolError),
    Disconnect(DisconnectReason),
}

/// Discriminant of a [`ServerEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    ConversationsList,
    Conversation,
    MessagesList,
    NewMessage,
    MessageResult,
    MessagesMarkedRead,
    Error,
    Disconnect,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::ConversationsList => "conversationsList",
            Self::Conversation => "conversation",
            Self::MessagesList => "messagesList",
            Self::NewMessage => "newMessage",
            Self::MessageResult => "messageResult",
            Self::MessagesMarkedRead => "messagesMarkedRead",
            Self::Error => "error",
            Self::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    /// Returns the discriminant of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Ready => EventKind::Ready,
            Self::ConversationsList(_) => EventKind::ConversationsList,
            Self::Conversation(_) => EventKind::Conversation,
            Self::MessagesList(_) => EventKind::MessagesList,
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::MessageResult(_) => EventKind::MessageResult,
            Self::MessagesMarkedRead(_) => EventKind::MessagesMarkedRead,
            Self::Error(_) => EventKind::Error,
            Self::Disconnect(_) => EventKind::Disconnect,
        }
    }
}
