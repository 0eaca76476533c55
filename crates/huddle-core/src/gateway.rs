//! Gateways to external storage.
//!
//! The router persists messages and records online/offline transitions
//! through these traits. It never implements durable storage itself.

use async_trait::async_trait;
use huddle_protocol::{ChatMessage, MessageType, SenderProfile};
use thiserror::Error;

/// Default number of messages fetched on join.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Gateway errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The call did not complete in time.
    #[error("Gateway call timed out")]
    Timeout,

    /// The backing store could not be reached.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// The backing store refused the request.
    #[error("Gateway rejected request: {0}")]
    Rejected(String),
}

/// A message ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender: SenderProfile,
    pub content: String,
    pub room: String,
    pub message_type: MessageType,
}

/// Online status of a user as recorded by a [`PresenceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStatus {
    pub online: bool,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning it with its assigned id and timestamp.
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, GatewayError>;

    /// Fetch up to `limit` messages of a room, newest first.
    async fn fetch_recent(&self, room: &str, limit: usize)
        -> Result<Vec<ChatMessage>, GatewayError>;
}

/// Durable record of users' online state.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark a user online as of `at`.
    async fn set_online(&self, user_id: &str, at: u64) -> Result<(), GatewayError>;

    /// Mark a user offline as of `at`.
    async fn set_offline(&self, user_id: &str, at: u64) -> Result<(), GatewayError>;
}
