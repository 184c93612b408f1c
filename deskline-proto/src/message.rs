//! Message types shared by the console and the messaging backend.
//!
//! [`MessageRecord`] is the server-side shape of a message as it appears on
//! the wire. Locally created messages are identified by a [`TempId`] until
//! the server assigns a [`MessageId`]; [`MessageKey`] captures both states.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationId;

/// Maximum allowed outgoing text size in bytes.
pub const MAX_TEXT_LEN: usize = 4096;

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Wraps a raw server id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw server id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation id for an optimistically created message.
///
/// Backed by a UUID v7, so ids are unique per process and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(Uuid);

impl TempId {
    /// Creates a fresh time-ordered correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TempId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a message held by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Created locally, awaiting server confirmation.
    Pending(TempId),
    /// Confirmed by the server.
    Confirmed(MessageId),
}

impl MessageKey {
    /// Returns the server id, if confirmed.
    #[must_use]
    pub const fn server_id(&self) -> Option<MessageId> {
        match self {
            Self::Confirmed(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }

    /// Returns the correlation id, if still pending.
    #[must_use]
    pub const fn temp_id(&self) -> Option<TempId> {
        match self {
            Self::Pending(temp) => Some(*temp),
            Self::Confirmed(_) => None,
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(temp) => write!(f, "temp:{temp}"),
            Self::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

/// UTC instant, RFC 3339 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the underlying `chrono` value.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self(DateTime::<Utc>::default())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Sticker,
    Location,
    System,
}

impl MessageType {
    /// Whether this type carries an uploaded file.
    #[must_use]
    pub const fn is_attachment(self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio | Self::File)
    }
}

/// Which side of the conversation produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the customer to the business.
    Incoming,
    /// From an agent to the customer.
    Outgoing,
}

/// Delivery lifecycle of a message as seen by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created locally, not yet confirmed.
    Pending,
    /// Confirmed by the server.
    #[default]
    Done,
    /// Rejected or never announced. Terminal.
    Failed,
}

/// File metadata attached to an image/video/audio/file message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Public URL; absent until the upload finished.
    pub url: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub thumbnail_url: Option<String>,
}

/// A message as stored and pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub message_type: MessageType,
    pub direction: Direction,
    #[serde(default)]
    pub status: DeliveryStatus,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub sent_at: Timestamp,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Echo of the sender's correlation id for messages sent by this console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_message_id: Option<TempId>,
}

impl MessageRecord {
    /// Collects the flat file fields into an [`Attachment`], if any are set.
    #[must_use]
    pub fn attachment(&self) -> Option<Attachment> {
        if self.file_url.is_none() && self.file_name.is_none() {
            return None;
        }
        Some(Attachment {
            url: self.file_url.clone(),
            file_name: self.file_name.clone().unwrap_or_default(),
            mime_type: self
                .file_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: self.file_size.unwrap_or(0),
            thumbnail_url: self.thumbnail_url.clone(),
        })
    }
}

/// Error returned when outgoing text fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Text exceeds [`MAX_TEXT_LEN`].
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outgoing text before any network interaction.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank text, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_TEXT_LEN`].
pub fn validate_text(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if text.len() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLarge {
            size: text.len(),
            max: MAX_TEXT_LEN,
        });
    }
    Ok(())
}
