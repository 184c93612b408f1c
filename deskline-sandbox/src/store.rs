//! In-memory conversations, messages and uploads.
//!
//! Projects are created lazily on first access, optionally seeded with demo
//! conversations. Ids are unique across projects so the REST routes, which
//! carry no project, can find a conversation by id alone.
//!
//! List cursors are the id of the last item of the previous page.

use std::collections::HashMap;

use chrono::Duration;
use tokio::sync::RwLock;

use deskline_proto::conversation::{
    Conversation, ConversationId, ConversationStatus, CustomerId, MessagePreview, Platform,
};
use deskline_proto::event::{ConversationPage, ConversationsQuery, Cursor, MessagePage, MessagesQuery, SendMessage};
use deskline_proto::message::{DeliveryStatus, Direction, MessageId, MessageRecord, MessageType, Timestamp};

/// Errors surfaced to clients as `messageResult` failures or REST statuses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Conversation {0} not found")]
    UnknownConversation(ConversationId),

    #[error("Conversation is already closed")]
    AlreadyClosed,

    #[error("Conversation is closed")]
    ConversationClosed,

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Upload {0} not found")]
    UnknownUpload(String),
}

/// A file received on the upload sink.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_name: String,
    pub mime_type: String,
    /// `None` until the bytes are uploaded.
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Project {
    conversations: Vec<Conversation>,
    /// Oldest first per conversation.
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
}

#[derive(Debug, Default)]
struct Ids {
    conversation: i64,
    message: i64,
    upload: u64,
}

impl Ids {
    const fn next_conversation(&mut self) -> ConversationId {
        self.conversation += 1;
        ConversationId::new(self.conversation)
    }

    const fn next_message(&mut self) -> MessageId {
        self.message += 1;
        MessageId::new(self.message)
    }
}

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<String, Project>,
    uploads: HashMap<String, StoredFile>,
    ids: Ids,
}

/// Thread-safe backend state.
pub struct SandboxStore {
    inner: RwLock<Inner>,
    seed: bool,
}

impl SandboxStore {
    /// Creates an empty store. With `seed`, every new project starts with
    /// demo conversations.
    #[must_use]
    pub fn new(seed: bool) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            seed,
        }
    }

    /// Add a conversation to a project.
    pub async fn create_conversation(
        &self,
        project: &str,
        platform: Platform,
        display_name: &str,
        status: ConversationStatus,
    ) -> Conversation {
        let mut inner = self.inner.write().await;
        let Inner { projects, ids, .. } = &mut *inner;
        let seed = self.seed;
        let project = projects
            .entry(project.to_string())
            .or_insert_with(|| Project::new(ids, seed));
        project.add_conversation(ids, platform, display_name, status, Timestamp::now())
    }

    /// One page of a project's conversations, most recent activity first.
    pub async fn list_conversations(&self, project: &str, query: &ConversationsQuery) -> ConversationPage {
        let mut inner = self.inner.write().await;
        let project = inner.project(project, self.seed);

        let mut matching: Vec<&Conversation> = project
            .conversations
            .iter()
            .filter(|c| query.status.is_none_or(|s| s == c.status))
            .filter(|c| query.platform.is_none_or(|p| p == c.platform))
            .collect();
        matching.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let start = query
            .cursor
            .as_ref()
            .and_then(parse_cursor)
            .and_then(|after| matching.iter().position(|c| c.id.get() == after))
            .map_or(0, |pos| pos + 1);
        let limit = page_limit(query.limit);
        let end = (start + limit).min(matching.len());
        let page: Vec<Conversation> = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|c| (*c).clone())
            .collect();
        let has_more = end < matching.len();

        ConversationPage {
            next_cursor: has_more
                .then(|| page.last().map(|c| Cursor::new(c.id.to_string())))
                .flatten(),
            conversations: page,
            has_more,
        }
    }

    /// One page of a conversation's history, oldest first, walking
    /// backwards from the cursor.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownConversation`] if the project has no such conversation.
    pub async fn list_messages(&self, project: &str, query: &MessagesQuery) -> Result<MessagePage, StoreError> {
        let mut inner = self.inner.write().await;
        let project = inner.project(project, self.seed);
        project.find(query.conversation_id)?;

        let history = project
            .messages
            .get(&query.conversation_id)
            .map_or(&[][..], Vec::as_slice);
        let end = query
            .cursor
            .as_ref()
            .and_then(parse_cursor)
            .and_then(|before| history.iter().position(|m| m.id.get() == before))
            .unwrap_or(history.len());
        let start = end.saturating_sub(page_limit(query.limit));
        let page = history.get(start..end).unwrap_or_default().to_vec();
        let has_more = start > 0;

        Ok(MessagePage {
            conversation_id: query.conversation_id,
            next_cursor: has_more
                .then(|| page.first().map(|m| Cursor::new(m.id.to_string())))
                .flatten(),
            messages: page,
            has_more,
        })
    }

    /// Store an operator message, echoing its temp id.
    ///
    /// # Errors
    ///
    /// Fails for unknown or closed conversations and empty text.
    pub async fn send_message(
        &self,
        project: &str,
        send: &SendMessage,
    ) -> Result<(MessageRecord, Conversation), StoreError> {
        if send.message_type == MessageType::Text
            && send.content.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(StoreError::EmptyContent);
        }

        let mut inner = self.inner.write().await;
        let Inner { projects, ids, .. } = &mut *inner;
        let seed = self.seed;
        let project = projects
            .entry(project.to_string())
            .or_insert_with(|| Project::new(ids, seed));
        if project.find(send.conversation_id)?.status == ConversationStatus::Closed {
            return Err(StoreError::ConversationClosed);
        }

        let now = Timestamp::now();
        let record = MessageRecord {
            id: ids.next_message(),
            conversation_id: send.conversation_id,
            message_type: send.message_type,
            direction: Direction::Outgoing,
            status: DeliveryStatus::Done,
            content: send.content.clone(),
            file_url: send.file_url.clone(),
            file_name: send.file_name.clone(),
            file_type: send.file_type.clone(),
            file_size: send.file_size,
            thumbnail_url: None,
            sent_at: now,
            created_at: Some(now),
            temp_message_id: Some(send.temp_message_id),
        };
        let conversation = project.append(record.clone(), false)?;
        Ok((record, conversation))
    }

    /// Store a customer message. A closed conversation is reopened.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownConversation`] if the project has no such conversation.
    pub async fn receive_message(
        &self,
        project: &str,
        id: ConversationId,
        content: &str,
    ) -> Result<(MessageRecord, Conversation), StoreError> {
        let mut inner = self.inner.write().await;
        let Inner { projects, ids, .. } = &mut *inner;
        let seed = self.seed;
        let project = projects
            .entry(project.to_string())
            .or_insert_with(|| Project::new(ids, seed));
        project.find(id)?;

        let now = Timestamp::now();
        let record = text_record(ids.next_message(), id, Direction::Incoming, content, now);
        let conversation = project.append(record.clone(), true)?;
        Ok((record, conversation))
    }

    /// Reset a conversation's unread counter.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownConversation`] if the project has no such conversation.
    pub async fn mark_read(&self, project: &str, id: ConversationId) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        let project = inner.project(project, self.seed);
        let conversation = project.find_mut(id)?;
        conversation.unread_count = 0;
        Ok(conversation.clone())
    }

    /// Close a conversation. Returns its project and new state.
    ///
    /// # Errors
    ///
    /// Fails for unknown or already closed conversations.
    pub async fn close_conversation(&self, id: ConversationId) -> Result<(String, Conversation), StoreError> {
        self.update_anywhere(id, |conversation| {
            if conversation.status == ConversationStatus::Closed {
                return Err(StoreError::AlreadyClosed);
            }
            conversation.status = ConversationStatus::Closed;
            Ok(())
        })
        .await
    }

    /// Link a conversation to a customer. Returns its project and new state.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownConversation`] if no project has the conversation.
    pub async fn link_customer(
        &self,
        id: ConversationId,
        customer: CustomerId,
    ) -> Result<(String, Conversation), StoreError> {
        self.update_anywhere(id, |conversation| {
            conversation.customer_id = Some(customer);
            Ok(())
        })
        .await
    }

    async fn update_anywhere(
        &self,
        id: ConversationId,
        f: impl FnOnce(&mut Conversation) -> Result<(), StoreError>,
    ) -> Result<(String, Conversation), StoreError> {
        let mut inner = self.inner.write().await;
        let (name, conversation) = inner
            .projects
            .iter_mut()
            .find_map(|(name, project)| project.find_mut(id).ok().map(|c| (name, c)))
            .ok_or(StoreError::UnknownConversation(id))?;
        f(conversation)?;
        Ok((name.clone(), conversation.clone()))
    }

    /// Reserve an upload slot. Returns its key.
    pub async fn reserve_upload(&self, file_name: &str, mime_type: &str) -> String {
        let mut inner = self.inner.write().await;
        inner.ids.upload += 1;
        let key = format!("u{}", inner.ids.upload);
        inner.uploads.insert(
            key.clone(),
            StoredFile {
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                bytes: None,
            },
        );
        key
    }

    /// Store the bytes of a reserved upload.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownUpload`] if `key` was never reserved.
    pub async fn complete_upload(&self, key: &str, mime_type: Option<String>, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let file = inner
            .uploads
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownUpload(key.to_string()))?;
        if let Some(mime_type) = mime_type {
            file.mime_type = mime_type;
        }
        file.bytes = Some(bytes);
        Ok(())
    }

    /// A stored upload, if its bytes have arrived.
    pub async fn upload(&self, key: &str) -> Option<StoredFile> {
        let inner = self.inner.read().await;
        inner.uploads.get(key).filter(|f| f.bytes.is_some()).cloned()
    }
}

impl Inner {
    fn project(&mut self, name: &str, seed: bool) -> &mut Project {
        let Self { projects, ids, .. } = self;
        projects
            .entry(name.to_string())
            .or_insert_with(|| Project::new(ids, seed))
    }
}

impl Project {
    fn new(ids: &mut Ids, seed: bool) -> Self {
        let mut project = Self::default();
        if seed {
            project.seed(ids);
        }
        project
    }

    fn seed(&mut self, ids: &mut Ids) {
        let now = *Timestamp::now().as_datetime();
        let at = |minutes: i64| Timestamp::from(now - Duration::minutes(minutes));

        let mina = self.add_conversation(ids, Platform::Instagram, "Mina Park", ConversationStatus::Active, at(30));
        for (minutes, direction, text) in [
            (30, Direction::Incoming, "Hi, is the blue jacket still in stock?"),
            (28, Direction::Outgoing, "Yes! We have it in M and L."),
            (5, Direction::Incoming, "Great, I'll take an M."),
        ] {
            let record = text_record(ids.next_message(), mina.id, direction, text, at(minutes));
            let _ = self.append(record, direction == Direction::Incoming);
        }

        let leo = self.add_conversation(ids, Platform::Line, "Leo Tanaka", ConversationStatus::Active, at(60));
        let record = text_record(
            ids.next_message(),
            leo.id,
            Direction::Incoming,
            "Can I change my delivery address?",
            at(12),
        );
        let _ = self.append(record, true);

        let sam = self.add_conversation(ids, Platform::Telegram, "Sam Rivera", ConversationStatus::Closed, at(600));
        let record = text_record(
            ids.next_message(),
            sam.id,
            Direction::Outgoing,
            "Your refund has been processed.",
            at(600),
        );
        let _ = self.append(record, false);
    }

    fn add_conversation(
        &mut self,
        ids: &mut Ids,
        platform: Platform,
        display_name: &str,
        status: ConversationStatus,
        at: Timestamp,
    ) -> Conversation {
        let id = ids.next_conversation();
        let conversation = Conversation {
            id,
            platform,
            external_id: format!("{platform}-{}", id.get()),
            display_name: display_name.to_string(),
            status,
            unread_count: 0,
            last_activity_at: at,
            last_message: None,
            customer_id: None,
        };
        self.conversations.push(conversation.clone());
        conversation
    }

    fn find(&self, id: ConversationId) -> Result<&Conversation, StoreError> {
        self.conversations
            .iter()
            .find(|c| c.id == id)
            .ok_or(StoreError::UnknownConversation(id))
    }

    fn find_mut(&mut self, id: ConversationId) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::UnknownConversation(id))
    }

    /// Append a message and refresh the conversation's list fields.
    fn append(&mut self, record: MessageRecord, inbound: bool) -> Result<Conversation, StoreError> {
        let conversation = self.find_mut(record.conversation_id)?;
        conversation.last_message = Some(MessagePreview {
            content: record.content.clone(),
            message_type: record.message_type,
            direction: record.direction,
            sent_at: record.sent_at,
        });
        conversation.last_activity_at = conversation.last_activity_at.max(record.sent_at);
        if inbound {
            conversation.unread_count += 1;
            conversation.status = ConversationStatus::Active;
        }
        let updated = conversation.clone();

        let history = self.messages.entry(record.conversation_id).or_default();
        let at = history.partition_point(|m| m.sent_at <= record.sent_at);
        history.insert(at, record);
        Ok(updated)
    }
}

fn text_record(
    id: MessageId,
    conversation_id: ConversationId,
    direction: Direction,
    text: &str,
    at: Timestamp,
) -> MessageRecord {
    MessageRecord {
        id,
        conversation_id,
        message_type: MessageType::Text,
        direction,
        status: DeliveryStatus::Done,
        content: Some(text.to_string()),
        file_url: None,
        file_name: None,
        file_type: None,
        file_size: None,
        thumbnail_url: None,
        sent_at: at,
        created_at: Some(at),
        temp_message_id: None,
    }
}

fn parse_cursor(cursor: &Cursor) -> Option<i64> {
    cursor.as_str().parse().ok()
}

fn page_limit(limit: u32) -> usize {
    usize::try_from(limit.max(1)).unwrap_or(usize::MAX)
}
