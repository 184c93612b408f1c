//! Conversation types and list filters.

use serde::{Deserialize, Serialize};

use crate::message::{Direction, MessageType, Timestamp};

/// Server-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(i64);

impl ConversationId {
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

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a customer record a conversation can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(i64);

impl CustomerId {
    /// Wraps a raw customer id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw customer id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messaging platform a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Telegram,
    Line,
    Facebook,
    Whatsapp,
    Webchat,
    /// Any platform tag this build does not know about.
    #[serde(other)]
    Other,
}

impl Platform {
    /// Returns the wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Telegram => "telegram",
            Self::Line => "line",
            Self::Facebook => "facebook",
            Self::Whatsapp => "whatsapp",
            Self::Webchat => "webchat",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instagram" => Ok(Self::Instagram),
            "telegram" => Ok(Self::Telegram),
            "line" => Ok(Self::Line),
            "facebook" => Ok(Self::Facebook),
            "whatsapp" => Ok(Self::Whatsapp),
            "webchat" => Ok(Self::Webchat),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Whether a conversation is still being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Closed,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Denormalized snapshot of the latest message, for list display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: MessageType,
    pub direction: Direction,
    pub sent_at: Timestamp,
}

/// A thread between one external customer identity and the business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub platform: Platform,
    /// Conversation identifier on the platform side.
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub unread_count: u32,
    pub last_activity_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
}

/// Status/platform filter applied to the conversation list.
///
/// `None` on either axis means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub platform: Option<Platform>,
}

impl ConversationFilter {
    /// Filter that matches every conversation.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            status: None,
            platform: None,
        }
    }

    /// Filter on status only.
    #[must_use]
    pub const fn with_status(status: ConversationStatus) -> Self {
        Self {
            status: Some(status),
            platform: None,
        }
    }

    /// Whether the conversation belongs in this filtered view.
    #[must_use]
    pub fn matches(&self, conversation: &Conversation) -> bool {
        self.status.is_none_or(|s| s == conversation.status)
            && self.platform.is_none_or(|p| p == conversation.platform)
    }
}

impl std::fmt::Display for ConversationFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}")?,
            None => f.write_str("all")?,
        }
        if let Some(platform) = self.platform {
            write!(f, "/{platform}")?;
        }
        Ok(())
    }
}
