//! Chat message model shared by the wire protocol and the message store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique message identifier assigned by the message store.
pub type MessageId = u64;

/// Kind of chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
        };
        f.write_str(name)
    }
}

/// Public profile fields of a message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl SenderProfile {
    /// Create a profile without an avatar.
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            avatar: None,
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    pub sender: SenderProfile,
    pub room: String,
    pub message_type: MessageType,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}
