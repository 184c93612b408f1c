//! Paged message window for the active conversation.

use deskline_proto::conversation::{ConversationId, MessagePreview};
use deskline_proto::event::{Command, ConversationRef, MessagePage, MessagesQuery};
use deskline_proto::message::{
    Attachment, DeliveryStatus, Direction, MessageId, MessageKey, MessageRecord, MessageType,
    TempId, Timestamp,
};

use crate::paging::{PageRequest, Pager};

/// A message as held by the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub message_type: MessageType,
    pub direction: Direction,
    pub status: DeliveryStatus,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    pub sent_at: Timestamp,
    pub created_at: Timestamp,
}

impl Message {
    /// Preview shown in the conversation list.
    #[must_use]
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            content: self
                .content
                .clone()
                .or_else(|| self.attachment.as_ref().map(|a| a.file_name.clone())),
            message_type: self.message_type,
            direction: self.direction,
            sent_at: self.sent_at,
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let attachment = record.attachment();
        Self {
            key: MessageKey::Confirmed(record.id),
            conversation_id: record.conversation_id,
            message_type: record.message_type,
            direction: record.direction,
            status: record.status,
            content: record.content,
            attachment,
            sent_at: record.sent_at,
            created_at: record.created_at.unwrap_or(record.sent_at),
        }
    }
}

/// Messages of the active conversation, oldest first.
#[derive(Debug)]
pub struct MessageStore {
    active: Option<ConversationId>,
    items: Vec<Message>,
    pager: Pager,
    page_size: u32,
}

impl MessageStore {
    #[must_use]
    pub fn new(page_size: u32) -> Self {
        Self {
            active: None,
            items: Vec::new(),
            pager: Pager::default(),
            page_size,
        }
    }

    /// Switch to `conversation`, returning the fetch and read-receipt commands.
    ///
    /// `None` clears the window and emits nothing. Re-activating the open
    /// conversation keeps its unresolved sends so their results still land.
    pub fn activate(&mut self, conversation: Option<ConversationId>) -> Vec<Command> {
        if conversation.is_some() && conversation == self.active {
            self.items.retain(|m| m.key.temp_id().is_some());
        } else {
            self.items.clear();
        }
        self.active = conversation;
        let Some(id) = conversation else {
            self.pager.reset();
            return Vec::new();
        };
        self.pager.begin_initial();
        tracing::debug!(conversation = %id, kept = self.items.len(), "activating conversation");
        vec![
            Command::GetMessages(MessagesQuery {
                conversation_id: id,
                limit: self.page_size,
                cursor: None,
            }),
            Command::MarkMessagesRead(ConversationRef {
                conversation_id: id,
            }),
        ]
    }

    /// Reload the open conversation on a new transport. Requests sent on the
    /// old one are forgotten.
    pub fn resync(&mut self) -> Vec<Command> {
        self.pager.forget_in_flight();
        self.activate(self.active)
    }

    /// Request the page before the oldest loaded message.
    pub fn load_older(&mut self) -> Option<Command> {
        let id = self.active?;
        let cursor = self.pager.begin_next()?;
        Some(Command::GetMessages(MessagesQuery {
            conversation_id: id,
            limit: self.page_size,
            cursor: Some(cursor),
        }))
    }

    /// Apply a `messagesList` reply. Returns `false` if it was ignored
    /// because it belongs to another conversation or answers a superseded
    /// request.
    ///
    /// An initial page replaces the server history but keeps local sends
    /// that are still unresolved.
    pub fn apply_page(&mut self, page: MessagePage) -> bool {
        if self.active != Some(page.conversation_id) {
            self.pager.skip_superseded();
            tracing::debug!(conversation = %page.conversation_id, "ignoring page for inactive conversation");
            return false;
        }
        let Some(request) = self.pager.finish(page.next_cursor, page.has_more) else {
            return false;
        };
        if request == PageRequest::Initial {
            self.items.retain(|m| m.key.temp_id().is_some());
        }
        for message in page.messages.into_iter().map(Message::from) {
            if self.position(&message.key).is_none() {
                self.items.push(message);
            }
        }
        self.items.sort_by_key(|m| m.sent_at);
        true
    }

    /// Insert a message pushed by the server. Returns `true` if it was added.
    pub fn append_incoming(&mut self, message: Message) -> bool {
        if self.active != Some(message.conversation_id) || self.position(&message.key).is_some() {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Insert an optimistic message. Returns `false` if it is not for the
    /// active conversation.
    pub fn push_pending(&mut self, message: Message) -> bool {
        if self.active != Some(message.conversation_id) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Equal timestamps keep arrival order.
    fn insert_sorted(&mut self, message: Message) {
        let index = self.items.partition_point(|m| m.sent_at <= message.sent_at);
        self.items.insert(index, message);
    }

    /// Swap a pending entry to its server id.
    ///
    /// If the confirmed id is already present (pushed before the
    /// confirmation arrived), the pending entry is dropped instead.
    pub fn confirm(&mut self, temp: TempId, id: MessageId, sent_at: Option<Timestamp>) -> bool {
        let Some(index) = self.position(&MessageKey::Pending(temp)) else {
            return false;
        };
        if self.position(&MessageKey::Confirmed(id)).is_some() {
            self.items.remove(index);
            return true;
        }
        let mut message = self.items.remove(index);
        message.key = MessageKey::Confirmed(id);
        message.status = DeliveryStatus::Done;
        if let Some(at) = sent_at {
            message.sent_at = at;
        }
        self.insert_sorted(message);
        true
    }

    /// Mark a pending entry failed.
    pub fn fail(&mut self, temp: TempId) -> bool {
        self.pending_mut(temp).is_some_and(|m| {
            m.status = DeliveryStatus::Failed;
            true
        })
    }

    /// Record where an uploaded attachment now lives.
    pub fn set_attachment_url(&mut self, temp: TempId, url: String) -> bool {
        self.pending_mut(temp)
            .and_then(|m| m.attachment.as_mut())
            .is_some_and(|a| {
                a.url = Some(url);
                true
            })
    }

    fn pending_mut(&mut self, temp: TempId) -> Option<&mut Message> {
        let key = MessageKey::Pending(temp);
        self.items.iter_mut().find(|m| m.key == key)
    }

    fn position(&self, key: &MessageKey) -> Option<usize> {
        self.items.iter().position(|m| &m.key == key)
    }

    #[must_use]
    pub fn find(&self, key: &MessageKey) -> Option<&Message> {
        self.items.iter().find(|m| &m.key == key)
    }

    #[must_use]
    pub const fn active(&self) -> Option<ConversationId> {
        self.active
    }

    /// Messages oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.items
    }

    /// Messages newest first.
    pub fn newest_first(&self) -> impl Iterator<Item = &Message> {
        self.items.iter().rev()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.pager.is_loading()
    }

    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.pager.has_more()
    }
}
