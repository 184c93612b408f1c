//! Optimistic send coordination.
//!
//! Every send gets a fresh [`TempId`] and an entry here. The entry moves from
//! pending to done or failed exactly once; later results for the same temp
//! id are reported as [`Transition::AlreadyResolved`] and change nothing.
//! Only the most recent [`RESOLVED_RETAINED`] resolved entries are kept;
//! pending entries are never dropped.

use std::collections::{HashMap, VecDeque};

use deskline_proto::conversation::ConversationId;
use deskline_proto::event::{Command, SendMessage};
use deskline_proto::message::{
    self, Attachment, DeliveryStatus, Direction, MessageId, MessageKey, MessageType, TempId,
    Timestamp, ValidationError,
};

use crate::attachment::OutgoingFile;
use crate::messages::Message;

/// Why a send was refused before anything was emitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRejection {
    #[error("select a conversation before sending")]
    NoActiveConversation,

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl SendRejection {
    /// Rejections the user is not told about.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::Invalid(ValidationError::Empty))
    }
}

/// Lifecycle of one optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Done(MessageId),
    Failed,
}

/// Result of feeding a confirmation or rejection to the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The entry left the pending state.
    Applied,
    /// The entry was already done or failed; nothing changed.
    AlreadyResolved,
    /// No send with this temp id is known.
    Unknown,
}

#[derive(Debug)]
struct Entry {
    conversation_id: ConversationId,
    state: OutboxState,
}

/// How many resolved sends are remembered for deduplicating late results.
pub const RESOLVED_RETAINED: usize = 256;

/// Tracks optimistic sends by temp id.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: HashMap<TempId, Entry>,
    /// Resolved temp ids, oldest first.
    resolved: VecDeque<TempId>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending text message and the command announcing it.
    ///
    /// # Errors
    ///
    /// Returns [`SendRejection`] when no conversation is active or the text
    /// fails validation.
    pub fn compose_text(
        &mut self,
        active: Option<ConversationId>,
        text: &str,
    ) -> Result<(Message, Command), SendRejection> {
        let conversation_id = active.ok_or(SendRejection::NoActiveConversation)?;
        message::validate_text(text)?;

        let temp = self.register(conversation_id);
        let content = text.trim().to_string();
        let command = Command::SendMessage(SendMessage {
            conversation_id,
            message_type: MessageType::Text,
            temp_message_id: temp,
            content: Some(content.clone()),
            file_url: None,
            file_name: None,
            file_type: None,
            file_size: None,
        });
        let message = pending_message(temp, conversation_id, MessageType::Text, Some(content), None);
        Ok((message, command))
    }

    /// Create a pending attachment message. The announcing command is
    /// built later, once the file has a URL.
    ///
    /// # Errors
    ///
    /// Returns [`SendRejection::NoActiveConversation`] when no conversation
    /// is active.
    pub fn compose_attachment(
        &mut self,
        active: Option<ConversationId>,
        message_type: MessageType,
        file: &OutgoingFile,
    ) -> Result<Message, SendRejection> {
        let conversation_id = active.ok_or(SendRejection::NoActiveConversation)?;
        let temp = self.register(conversation_id);
        let attachment = Attachment {
            url: None,
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size(),
            thumbnail_url: None,
        };
        Ok(pending_message(
            temp,
            conversation_id,
            message_type,
            None,
            Some(attachment),
        ))
    }

    fn register(&mut self, conversation_id: ConversationId) -> TempId {
        let temp = TempId::new();
        self.entries.insert(
            temp,
            Entry {
                conversation_id,
                state: OutboxState::Pending,
            },
        );
        tracing::debug!(temp = %temp, conversation = %conversation_id, "send pending");
        temp
    }

    /// Record a server confirmation.
    pub fn confirm(&mut self, temp: TempId, id: MessageId) -> Transition {
        self.resolve(temp, OutboxState::Done(id))
    }

    /// Record a rejection or local failure.
    pub fn fail(&mut self, temp: TempId) -> Transition {
        self.resolve(temp, OutboxState::Failed)
    }

    fn resolve(&mut self, temp: TempId, outcome: OutboxState) -> Transition {
        let Some(entry) = self.entries.get_mut(&temp) else {
            return Transition::Unknown;
        };
        if entry.state != OutboxState::Pending {
            tracing::debug!(temp = %temp, state = ?entry.state, "send already resolved");
            return Transition::AlreadyResolved;
        }
        entry.state = outcome;
        tracing::debug!(temp = %temp, conversation = %entry.conversation_id, state = ?outcome, "send resolved");
        self.resolved.push_back(temp);
        if self.resolved.len() > RESOLVED_RETAINED
            && let Some(oldest) = self.resolved.pop_front()
        {
            self.entries.remove(&oldest);
        }
        Transition::Applied
    }

    #[must_use]
    pub fn state(&self, temp: TempId) -> Option<OutboxState> {
        self.entries.get(&temp).map(|e| e.state)
    }

    /// Number of sends still waiting for the server.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == OutboxState::Pending)
            .count()
    }
}

fn pending_message(
    temp: TempId,
    conversation_id: ConversationId,
    message_type: MessageType,
    content: Option<String>,
    attachment: Option<Attachment>,
) -> Message {
    let now = Timestamp::now();
    Message {
        key: MessageKey::Pending(temp),
        conversation_id,
        message_type,
        direction: Direction::Outgoing,
        status: DeliveryStatus::Pending,
        content,
        attachment,
        sent_at: now,
        created_at: now,
    }
}
