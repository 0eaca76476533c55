//! Session registry for Huddle.
//!
//! The registry owns the router's view of every joined connection: which
//! user occupies it and which room it is in. Rooms have no record of their
//! own; membership is read off the sessions.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Room used when an event does not name one.
pub const DEFAULT_ROOM: &str = "general";

/// Counter mixed into generated connection IDs so they are never reused.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity and room of a joined connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// External identity reference.
    pub user_id: String,
    /// Display name, unique among reachable users.
    pub username: String,
    /// Current room.
    pub room: String,
}

impl SessionInfo {
    /// Create session info, placing the user in the default room when none is given.
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, room: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            room: room.unwrap_or(DEFAULT_ROOM).to_string(),
        }
    }
}

/// Connection ID to session mapping.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, SessionInfo>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the session for a connection.
    ///
    /// Returns the session it replaced, if any.
    pub fn register(&self, connection_id: ConnectionId, info: SessionInfo) -> Option<SessionInfo> {
        debug!(
            connection = %connection_id,
            username = %info.username,
            room = %info.room,
            "Session registered"
        );
        self.sessions.insert(connection_id, info)
    }

    /// Get a copy of the session for a connection.
    #[must_use]
    pub fn lookup(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(connection_id).map(|s| s.value().clone())
    }

    /// Remove the session for a connection, returning it.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        let removed = self.sessions.remove(connection_id).map(|(_, info)| info);
        if removed.is_some() {
            debug!(connection = %connection_id, "Session removed");
        }
        removed
    }

    /// Check whether a connection is registered under the given username.
    #[must_use]
    pub fn holds(&self, connection_id: &ConnectionId, username: &str) -> bool {
        self.sessions
            .get(connection_id)
            .is_some_and(|s| s.username == username)
    }

    /// Any connection registered under `username` other than `except`.
    #[must_use]
    pub fn holder_of(&self, username: &str, except: &ConnectionId) -> Option<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.username == username && entry.key() != except)
            .map(|entry| entry.key().clone())
            .min()
    }

    /// Check whether any connection is registered for `user_id`.
    #[must_use]
    pub fn has_user(&self, user_id: &str) -> bool {
        self.sessions.iter().any(|entry| entry.user_id == user_id)
    }

    /// Connections whose current room is `room`.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.room == room)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
