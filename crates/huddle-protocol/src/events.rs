//! Event types for the Huddle protocol.
//!
//! Events are the fundamental unit of communication in Huddle. Every event is
//! an object tagged by its `event` name; field names are camelCase.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, MessageType};

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// The frame could not be decoded or is missing required fields.
    pub const MALFORMED: u16 = 4001;
    /// Message content is empty or too long.
    pub const INVALID_CONTENT: u16 = 4002;
    /// Room name is not acceptable.
    pub const INVALID_ROOM: u16 = 4003;
    /// The requested username is held by another live connection.
    pub const USERNAME_IN_USE: u16 = 4004;
    /// The join carried an empty user id or username.
    pub const INVALID_IDENTITY: u16 = 4005;
}

/// Inbound event kinds, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Join,
    SendMessage,
    Typing,
    PrivateMessage,
    MessageRead,
    Ping,
}

impl EventKind {
    /// Contract name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Join => "join",
            EventKind::SendMessage => "sendMessage",
            EventKind::Typing => "typing",
            EventKind::PrivateMessage => "privateMessage",
            EventKind::MessageRead => "messageRead",
            EventKind::Ping => "ping",
        }
    }
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Announce the connection's identity and enter a room.
    #[serde(rename_all = "camelCase")]
    Join {
        /// External identity reference.
        user_id: String,
        /// Display name.
        username: String,
        /// Room to enter, `general` when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },

    /// Post a message to a room.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Message body.
        content: String,
        /// Target room, `general` when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        /// Kind of message.
        #[serde(default)]
        message_type: MessageType,
    },

    /// Typing indicator, either for a room or for a single user.
    #[serde(rename_all = "camelCase")]
    Typing {
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        /// Target username for a private typing indicator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// Direct message to an online user.
    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        /// Target username.
        to: String,
        /// Message body.
        message: String,
        /// Client supplied id, echoed back for correlation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Read receipt for a private message.
    #[serde(rename_all = "camelCase")]
    MessageRead {
        /// Who read the message.
        from: String,
        /// Who sent the original message.
        to: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Join { .. } => EventKind::Join,
            ClientEvent::SendMessage { .. } => EventKind::SendMessage,
            ClientEvent::Typing { .. } => EventKind::Typing,
            ClientEvent::PrivateMessage { .. } => EventKind::PrivateMessage,
            ClientEvent::MessageRead { .. } => EventKind::MessageRead,
            ClientEvent::Ping { .. } => EventKind::Ping,
        }
    }

    /// Create a join event.
    #[must_use]
    pub fn join(
        user_id: impl Into<String>,
        username: impl Into<String>,
        room: Option<&str>,
    ) -> Self {
        ClientEvent::Join {
            user_id: user_id.into(),
            username: username.into(),
            room: room.map(str::to_string),
        }
    }

    /// Create a text message event.
    #[must_use]
    pub fn send_message(content: impl Into<String>, room: Option<&str>) -> Self {
        ClientEvent::SendMessage {
            content: content.into(),
            room: room.map(str::to_string),
            message_type: MessageType::Text,
        }
    }

    /// Create a private message event.
    #[must_use]
    pub fn private_message(
        to: impl Into<String>,
        message: impl Into<String>,
        message_id: Option<&str>,
    ) -> Self {
        ClientEvent::PrivateMessage {
            to: to.into(),
            message: message.into(),
            message_id: message_id.map(str::to_string),
        }
    }
}

/// An event sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Connection established.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// History snapshot for the room just joined, oldest first.
    RecentMessages { messages: Vec<ChatMessage> },

    /// Someone entered the room.
    UserJoined { username: String, message: String },

    /// A message was posted to the room.
    NewMessage(ChatMessage),

    /// Room typing indicator.
    #[serde(rename_all = "camelCase")]
    UserTyping { username: String, is_typing: bool },

    /// Private typing indicator.
    #[serde(rename_all = "camelCase")]
    PrivateTyping { from: String, is_typing: bool },

    /// Direct message.
    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        from: String,
        message: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Read receipt.
    MessageRead { from: String, to: String },

    /// Someone left the room.
    UserLeft { username: String, message: String },

    /// Full presence snapshot.
    UpdateUserList { users: Vec<String> },

    /// Rejection of the last inbound event.
    Error { code: u16, message: String },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Contract name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::RecentMessages { .. } => "recentMessages",
            ServerEvent::UserJoined { .. } => "userJoined",
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::PrivateTyping { .. } => "privateTyping",
            ServerEvent::PrivateMessage { .. } => "privateMessage",
            ServerEvent::MessageRead { .. } => "messageRead",
            ServerEvent::UserLeft { .. } => "userLeft",
            ServerEvent::UpdateUserList { .. } => "updateUserList",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create a Connected event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create a UserJoined notice.
    #[must_use]
    pub fn user_joined(username: impl Into<String>) -> Self {
        let username = username.into();
        ServerEvent::UserJoined {
            message: format!("{username} joined the chat"),
            username,
        }
    }

    /// Create a UserLeft notice.
    #[must_use]
    pub fn user_left(username: impl Into<String>) -> Self {
        let username = username.into();
        ServerEvent::UserLeft {
            message: format!("{username} left the chat"),
            username,
        }
    }

    /// Create an Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}
