//! In-process gateway implementations.
//!
//! Used by the server binary when no durable backend is configured, and by tests.

use crate::gateway::{GatewayError, MessageStore, NewMessage, PresenceStore, UserStatus};
use crate::message::{now_millis, MAX_CONTENT_LENGTH};
use async_trait::async_trait;
use dashmap::DashMap;
use huddle_protocol::ChatMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Default number of messages retained per room.
pub const DEFAULT_ROOM_RETENTION: usize = 1000;

/// Message store keeping the most recent messages of each room in memory.
#[derive(Debug)]
pub struct MemoryMessageStore {
    rooms: DashMap<String, Vec<ChatMessage>>,
    next_id: AtomicU64,
    retention: usize,
}

impl MemoryMessageStore {
    /// Create a store with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_ROOM_RETENTION)
    }

    /// Create a store keeping at most `retention` messages per room.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
            retention: retention.max(1),
        }
    }

    /// Number of stored messages in a room.
    #[must_use]
    pub fn room_len(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, GatewayError> {
        if message.content.is_empty() || message.content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(GatewayError::Rejected("content length out of range".into()));
        }

        let stored = ChatMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            content: message.content,
            sender: message.sender,
            room: message.room,
            message_type: message.message_type,
            created_at: now_millis(),
        };

        let mut room = self.rooms.entry(stored.room.clone()).or_default();
        room.push(stored.clone());
        if room.len() > self.retention {
            let excess = room.len() - self.retention;
            room.drain(..excess);
        }

        trace!(room = %stored.room, id = stored.id, "Message stored");
        Ok(stored)
    }

    async fn fetch_recent(
        &self,
        room: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        Ok(self
            .rooms
            .get(room)
            .map(|messages| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Presence store keeping user statuses in memory.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    statuses: DashMap<String, UserStatus>,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded status of a user.
    #[must_use]
    pub fn status(&self, user_id: &str) -> Option<UserStatus> {
        self.statuses.get(user_id).map(|s| *s)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: &str, at: u64) -> Result<(), GatewayError> {
        self.statuses.insert(
            user_id.to_string(),
            UserStatus {
                online: true,
                last_seen: at,
            },
        );
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, at: u64) -> Result<(), GatewayError> {
        self.statuses.insert(
            user_id.to_string(),
            UserStatus {
                online: false,
                last_seen: at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{MessageType, SenderProfile};

    fn draft(room: &str, content: &str) -> NewMessage {
        NewMessage {
            sender: SenderProfile::new("u1", "alice"),
            content: content.to_string(),
            room: room.to_string(),
            message_type: MessageType::Text,
        }
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let store = MemoryMessageStore::new();

        let first = store.save_message(draft("general", "one")).await.unwrap();
        let second = store.save_message(draft("general", "two")).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(second.sender.username, "alice");
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_fetch_recent_newest_first() {
        let store = MemoryMessageStore::new();
        for i in 0..5 {
            store
                .save_message(draft("general", &format!("m{i}")))
                .await
                .unwrap();
        }
        store.save_message(draft("rust", "other")).await.unwrap();

        let recent = store.fetch_recent("general", 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);

        assert!(store.fetch_recent("empty", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let store = MemoryMessageStore::with_retention(2);
        for i in 0..4 {
            store
                .save_message(draft("general", &format!("m{i}")))
                .await
                .unwrap();
        }

        assert_eq!(store.room_len("general"), 2);
        let recent = store.fetch_recent("general", 50).await.unwrap();
        assert_eq!(recent[1].content, "m2");
    }

    #[tokio::test]
    async fn test_save_rejects_oversized_content() {
        let store = MemoryMessageStore::new();
        let result = store
            .save_message(draft("general", &"a".repeat(MAX_CONTENT_LENGTH + 1)))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_presence_store_transitions() {
        let store = MemoryPresenceStore::new();
        assert!(store.status("u1").is_none());

        store.set_online("u1", 10).await.unwrap();
        assert_eq!(
            store.status("u1"),
            Some(UserStatus {
                online: true,
                last_seen: 10
            })
        );

        store.set_offline("u1", 20).await.unwrap();
        let status = store.status("u1").unwrap();
        assert!(!status.online);
        assert_eq!(status.last_seen, 20);
    }
}
