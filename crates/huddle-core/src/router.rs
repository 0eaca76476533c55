//! Event router for Huddle.
//!
//! The router consumes inbound client events, keeps the session registry and
//! presence index in step, calls the gateways for durable effects, and hands
//! the resulting events to the broadcaster.
//!
//! Each connection moves through three states:
//!
//! ```text
//! connect ──▶ Unjoined ──join──▶ Active ──disconnect──▶ Terminated
//!                 │                 ▲ │
//!                 │                 └─┘ join (overwrite)
//!                 └──────────disconnect──────────────────▶ Terminated
//! ```
//!
//! Events for one connection run one at a time under that connection's lane.
//! Registry and presence locks are never held across a gateway call.

use crate::broadcaster::{outbound_queue, Inbox, RoomBroadcaster, DEFAULT_OUTBOUND_CAPACITY};
use crate::gateway::{
    GatewayError, MessageStore, NewMessage, PresenceStore, DEFAULT_HISTORY_LIMIT,
};
use crate::message::{normalize_content, now_millis, validate_room_name};
use crate::presence::PresenceIndex;
use crate::session::{ConnectionId, SessionInfo, SessionRegistry};
use dashmap::DashMap;
use huddle_protocol::{codes, ClientEvent, MessageType, SenderProfile, ServerEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Default time allowed for a single gateway call.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rejections reported back to the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Message content is empty or too long.
    #[error("Invalid content: {0}")]
    InvalidContent(&'static str),

    /// Room name is not acceptable.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// Another live connection holds the username.
    #[error("Username already in use: {0}")]
    UsernameInUse(String),

    /// Join with an empty user id or username.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(&'static str),
}

impl RouterError {
    /// Wire error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouterError::InvalidContent(_) => codes::INVALID_CONTENT,
            RouterError::InvalidRoom(_) => codes::INVALID_ROOM,
            RouterError::UsernameInUse(_) => codes::USERNAME_IN_USE,
            RouterError::InvalidIdentity(_) => codes::INVALID_IDENTITY,
        }
    }

    /// Error event for the offending connection.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}

/// What happens when a join names a username another connection is reachable under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsernamePolicy {
    /// The newest join becomes reachable; the older connection stays registered.
    #[default]
    Displace,
    /// The join is refused.
    Reject,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Messages fetched for the joining connection.
    pub history_limit: usize,
    /// Time allowed for each gateway call.
    pub gateway_timeout: Duration,
    /// Duplicate username handling.
    pub username_policy: UsernamePolicy,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            username_policy: UsernamePolicy::Displace,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Live transport connections.
    pub connections: usize,
    /// Joined connections.
    pub sessions: usize,
    /// Reachable usernames.
    pub online_users: usize,
    /// Events accepted by recipient queues.
    pub delivered: u64,
    /// Events dropped for full, closed or departed recipients.
    pub dropped: u64,
    /// Failed or timed out gateway calls.
    pub gateway_failures: u64,
}

/// The central event router.
pub struct EventRouter {
    sessions: Arc<SessionRegistry>,
    presence: PresenceIndex,
    broadcaster: RoomBroadcaster,
    /// Per-connection serialization lanes; presence of a lane means the connection is live.
    lanes: DashMap<ConnectionId, Arc<Mutex<()>>>,
    messages: Arc<dyn MessageStore>,
    presence_store: Arc<dyn PresenceStore>,
    gateway_failures: AtomicU64,
    config: RouterConfig,
}

impl EventRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(messages: Arc<dyn MessageStore>, presence_store: Arc<dyn PresenceStore>) -> Self {
        Self::with_config(messages, presence_store, RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(
        messages: Arc<dyn MessageStore>,
        presence_store: Arc<dyn PresenceStore>,
        config: RouterConfig,
    ) -> Self {
        info!("Creating router with config: {:?}", config);
        let sessions = Arc::new(SessionRegistry::new());
        Self {
            broadcaster: RoomBroadcaster::new(Arc::clone(&sessions)),
            sessions,
            presence: PresenceIndex::new(),
            lanes: DashMap::new(),
            messages,
            presence_store,
            gateway_failures: AtomicU64::new(0),
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let (delivered, dropped) = self.broadcaster.totals();
        RouterStats {
            connections: self.broadcaster.connection_count(),
            sessions: self.sessions.len(),
            online_users: self.presence.len(),
            delivered,
            dropped,
            gateway_failures: self.gateway_failures.load(Ordering::Relaxed),
        }
    }

    /// Register a new transport connection in the Unjoined state.
    ///
    /// Returns the queue the transport drains to write events to the client.
    pub fn connect(&self, connection_id: &ConnectionId) -> Inbox {
        let (tx, rx) = outbound_queue(self.config.outbound_capacity);
        self.lanes
            .insert(connection_id.clone(), Arc::new(Mutex::new(())));
        self.broadcaster.attach(connection_id.clone(), tx);
        debug!(connection = %connection_id, "Connected");
        rx
    }

    /// Check if a connection is live (Unjoined or Active).
    #[must_use]
    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.lanes.contains_key(connection_id)
    }

    /// Get the session of a joined connection.
    #[must_use]
    pub fn session(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.lookup(connection_id)
    }

    /// Resolve a username to the connection it is reachable on.
    ///
    /// An entry whose connection no longer holds that username is treated as offline.
    #[must_use]
    pub fn resolve_connection(&self, username: &str) -> Option<ConnectionId> {
        self.presence
            .resolve(username)
            .filter(|conn| self.sessions.holds(conn, username))
    }

    /// Currently reachable usernames, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .presence
            .entries()
            .into_iter()
            .filter(|(username, conn)| self.sessions.holds(conn, username))
            .map(|(username, _)| username)
            .collect();
        users.sort();
        users
    }

    /// Handle one inbound event from a connection.
    ///
    /// Events from connections that are not live, and events other than
    /// `join` and `ping` from connections that have not joined, are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is rejected; nothing was persisted or
    /// broadcast for it.
    pub async fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RouterError> {
        let Some(lane) = self.lanes.get(connection_id).map(|l| Arc::clone(l.value())) else {
            debug!(connection = %connection_id, event = event.kind().as_str(), "Event for unknown connection dropped");
            return Ok(());
        };
        let _turn = lane.lock().await;

        // Disconnect may have retired the connection while we waited.
        if !self.lanes.contains_key(connection_id) {
            debug!(connection = %connection_id, "Event after disconnect dropped");
            return Ok(());
        }

        match event {
            ClientEvent::Join {
                user_id,
                username,
                room,
            } => self.join(connection_id, user_id, username, room).await,
            ClientEvent::SendMessage {
                content,
                room,
                message_type,
            } => {
                self.send_message(connection_id, &content, room, message_type)
                    .await
            }
            ClientEvent::Typing {
                is_typing,
                room,
                to,
            } => {
                self.typing(connection_id, is_typing, room, to);
                Ok(())
            }
            ClientEvent::PrivateMessage {
                to,
                message,
                message_id,
            } => {
                self.private_message(connection_id, &to, message, message_id);
                Ok(())
            }
            ClientEvent::MessageRead { from, to } => {
                self.message_read(connection_id, from, to);
                Ok(())
            }
            ClientEvent::Ping { timestamp } => {
                self.broadcaster
                    .deliver_to_connection(connection_id, ServerEvent::Pong { timestamp });
                Ok(())
            }
        }
    }

    /// Retire a connection.
    ///
    /// Idempotent: a connection that is already gone produces no events.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        let Some((_, lane)) = self.lanes.remove(connection_id) else {
            debug!(connection = %connection_id, "Disconnect for retired connection ignored");
            return;
        };
        // Wait for an in-flight event of this connection to finish.
        let _turn = lane.lock().await;

        self.broadcaster.detach(connection_id);

        let Some(session) = self.sessions.remove(connection_id) else {
            debug!(connection = %connection_id, "Disconnected before join");
            return;
        };

        if self.sessions.has_user(&session.user_id) {
            debug!(user = %session.user_id, "User still connected elsewhere, staying online");
        } else {
            let user_id = session.user_id.clone();
            self.call_gateway("set_offline", async {
                self.presence_store.set_offline(&user_id, now_millis()).await
            })
            .await;
        }

        self.broadcaster.deliver_to_room(
            &session.room,
            ServerEvent::user_left(&session.username),
            Some(connection_id),
        );

        self.release_username(&session.username, connection_id);

        self.broadcast_user_list();

        debug!(
            connection = %connection_id,
            username = %session.username,
            "Disconnected"
        );
    }

    async fn join(
        &self,
        connection_id: &ConnectionId,
        user_id: String,
        username: String,
        room: Option<String>,
    ) -> Result<(), RouterError> {
        let user_id = user_id.trim();
        let username = username.trim();
        if user_id.is_empty() {
            return Err(RouterError::InvalidIdentity("user id cannot be empty"));
        }
        if username.is_empty() {
            return Err(RouterError::InvalidIdentity("username cannot be empty"));
        }
        if let Some(room) = &room {
            validate_room_name(room).map_err(RouterError::InvalidRoom)?;
        }

        let info = SessionInfo::new(user_id, username, room.as_deref());

        let reject = self.config.username_policy == UsernamePolicy::Reject;
        self.presence
            .claim(username, connection_id, |holder| {
                reject && self.is_live_holder(holder, username)
            })
            .map_err(|_| RouterError::UsernameInUse(username.to_string()))?;

        let previous = self.sessions.register(connection_id.clone(), info.clone());
        if let Some(previous) = previous.filter(|p| p.username != info.username) {
            self.release_username(&previous.username, connection_id);
        }

        let uid = info.user_id.clone();
        self.call_gateway("set_online", async {
            self.presence_store.set_online(&uid, now_millis()).await
        })
        .await;

        self.broadcaster.deliver_to_room(
            &info.room,
            ServerEvent::user_joined(&info.username),
            Some(connection_id),
        );

        let history = self
            .call_gateway("fetch_recent", async {
                self.messages
                    .fetch_recent(&info.room, self.config.history_limit)
                    .await
            })
            .await;
        if let Some(mut messages) = history {
            messages.reverse();
            self.broadcaster
                .deliver_to_connection(connection_id, ServerEvent::RecentMessages { messages });
        }

        self.broadcast_user_list();

        debug!(
            connection = %connection_id,
            username = %info.username,
            room = %info.room,
            "Joined"
        );
        Ok(())
    }

    async fn send_message(
        &self,
        connection_id: &ConnectionId,
        content: &str,
        room: Option<String>,
        message_type: MessageType,
    ) -> Result<(), RouterError> {
        let Some(session) = self.sessions.lookup(connection_id) else {
            debug!(connection = %connection_id, "sendMessage before join dropped");
            return Ok(());
        };

        let room = room.unwrap_or(session.room);
        validate_room_name(&room).map_err(RouterError::InvalidRoom)?;
        let content = normalize_content(content).map_err(RouterError::InvalidContent)?;

        let draft = NewMessage {
            sender: SenderProfile::new(session.user_id, session.username),
            content: content.to_string(),
            room,
            message_type,
        };

        let saved = self
            .call_gateway("save_message", self.messages.save_message(draft))
            .await;

        if let Some(message) = saved {
            let room = message.room.clone();
            self.broadcaster
                .deliver_to_room(&room, ServerEvent::NewMessage(message), None);
        }
        Ok(())
    }

    fn typing(
        &self,
        connection_id: &ConnectionId,
        is_typing: bool,
        room: Option<String>,
        to: Option<String>,
    ) {
        let Some(session) = self.sessions.lookup(connection_id) else {
            return;
        };

        match to {
            Some(target) => match self.resolve_connection(&target) {
                Some(target_conn) => {
                    self.broadcaster.deliver_to_connection(
                        &target_conn,
                        ServerEvent::PrivateTyping {
                            from: session.username,
                            is_typing,
                        },
                    );
                }
                None => debug!(target = %target, "Typing target offline"),
            },
            None => {
                let room = room.unwrap_or(session.room);
                self.broadcaster.deliver_to_room(
                    &room,
                    ServerEvent::UserTyping {
                        username: session.username,
                        is_typing,
                    },
                    Some(connection_id),
                );
            }
        }
    }

    fn private_message(
        &self,
        connection_id: &ConnectionId,
        to: &str,
        message: String,
        message_id: Option<String>,
    ) {
        let Some(session) = self.sessions.lookup(connection_id) else {
            return;
        };

        let Some(target_conn) = self.resolve_connection(to) else {
            debug!(from = %session.username, to = %to, "Private message target offline");
            return;
        };

        self.broadcaster.deliver_to_connection(
            &target_conn,
            ServerEvent::PrivateMessage {
                from: session.username,
                message,
                timestamp: now_millis(),
                message_id,
            },
        );
    }

    fn message_read(&self, connection_id: &ConnectionId, from: String, to: String) {
        if self.sessions.lookup(connection_id).is_none() {
            return;
        }

        let Some(sender_conn) = self.resolve_connection(&to) else {
            debug!(reader = %from, sender = %to, "Read receipt target offline");
            return;
        };

        self.broadcaster
            .deliver_to_connection(&sender_conn, ServerEvent::MessageRead { from, to });
    }

    /// Whether `holder` still owns `username`: it is live and either
    /// registered under that name or between its claim and its registration.
    fn is_live_holder(&self, holder: &ConnectionId, username: &str) -> bool {
        self.lanes.contains_key(holder)
            && self
                .sessions
                .lookup(holder)
                .map_or(true, |session| session.username == username)
    }

    /// Drop `connection_id`'s claim on `username`, handing the name to another
    /// connection still registered under it.
    fn release_username(&self, username: &str, connection_id: &ConnectionId) {
        self.presence.release(username, connection_id, || {
            self.sessions.holder_of(username, connection_id)
        });
    }

    fn broadcast_user_list(&self) {
        self.broadcaster.broadcast(ServerEvent::UpdateUserList {
            users: self.online_users(),
        });
    }

    /// Run a gateway call under the configured timeout, logging failures.
    async fn call_gateway<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Option<T> {
        let result = match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                error!(operation = operation, error = %e, "Gateway call failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMessageStore, MemoryPresenceStore};

    fn router() -> (EventRouter, Arc<MemoryPresenceStore>) {
        let presence_store = Arc::new(MemoryPresenceStore::new());
        let router = EventRouter::new(Arc::new(MemoryMessageStore::new()), presence_store.clone());
        (router, presence_store)
    }

    fn drain(inbox: &mut Inbox) -> Vec<Arc<ServerEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[Arc<ServerEvent>]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_join_effects_in_order() {
        let (router, presence_store) = router();
        let conn = ConnectionId::from("c1");
        let mut inbox = router.connect(&conn);

        router
            .handle(&conn, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();

        let events = drain(&mut inbox);
        assert_eq!(names(&events), vec!["recentMessages", "updateUserList"]);
        assert_eq!(router.session(&conn).unwrap().room, "general");
        assert_eq!(router.resolve_connection("alice"), Some(conn));
        assert!(presence_store.status("u1").unwrap().online);
    }

    #[tokio::test]
    async fn test_events_before_join_are_dropped() {
        let (router, _) = router();
        let conn = ConnectionId::from("c1");
        let mut inbox = router.connect(&conn);

        router
            .handle(&conn, ClientEvent::send_message("hi", None))
            .await
            .unwrap();
        router
            .handle(&conn, ClientEvent::private_message("bob", "hi", None))
            .await
            .unwrap();

        assert!(drain(&mut inbox).is_empty());
        assert!(router.session(&conn).is_none());
    }

    #[tokio::test]
    async fn test_ping_answered_before_join() {
        let (router, _) = router();
        let conn = ConnectionId::from("c1");
        let mut inbox = router.connect(&conn);

        router
            .handle(&conn, ClientEvent::Ping { timestamp: Some(5) })
            .await
            .unwrap();

        let events = drain(&mut inbox);
        assert_eq!(*events[0], ServerEvent::Pong { timestamp: Some(5) });
    }

    #[tokio::test]
    async fn test_join_validation() {
        let (router, _) = router();
        let conn = ConnectionId::from("c1");
        let _inbox = router.connect(&conn);

        let err = router
            .handle(&conn, ClientEvent::join("u1", "  ", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_IDENTITY);

        let err = router
            .handle(&conn, ClientEvent::join("u1", "alice", Some("$admin")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ROOM);
        assert!(router.session(&conn).is_none());
        assert!(router.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_with_new_username_clears_old_entry() {
        let (router, _) = router();
        let conn = ConnectionId::from("c1");
        let _inbox = router.connect(&conn);

        router
            .handle(&conn, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();
        router
            .handle(&conn, ClientEvent::join("u1", "alicia", Some("rust")))
            .await
            .unwrap();

        assert_eq!(router.online_users(), vec!["alicia"]);
        assert!(router.resolve_connection("alice").is_none());
        assert_eq!(router.session(&conn).unwrap().room, "rust");
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_duplicate_username() {
        let router = reject_router();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let _i1 = router.connect(&c1);
        let _i2 = router.connect(&c2);

        router
            .handle(&c1, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();
        let err = router
            .handle(&c2, ClientEvent::join("u2", "alice", None))
            .await
            .unwrap_err();

        assert_eq!(err, RouterError::UsernameInUse("alice".to_string()));
        assert_eq!(err.to_event().name(), "error");
        assert!(router.session(&c2).is_none());
        assert_eq!(router.resolve_connection("alice"), Some(c1));
    }

    fn reject_router() -> EventRouter {
        EventRouter::with_config(
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            RouterConfig {
                username_policy: UsernamePolicy::Reject,
                ..RouterConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_reject_policy_keeps_holder_between_claim_and_register() {
        let router = reject_router();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let _i1 = router.connect(&c1);
        let _i2 = router.connect(&c2);

        // c1's join has claimed the name but not registered its session yet
        router.presence.claim("alice", &c1, |_| false).unwrap();

        let err = router
            .handle(&c2, ClientEvent::join("u2", "alice", None))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::UsernameInUse("alice".to_string()));
        assert_eq!(router.presence.resolve("alice"), Some(c1));
        assert!(router.session(&c2).is_none());
    }

    #[tokio::test]
    async fn test_reject_policy_takes_name_from_retired_holder() {
        let router = reject_router();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let _i2 = router.connect(&c2);

        // Entry left behind by a connection that is no longer live
        router.presence.claim("alice", &c1, |_| false).unwrap();

        router
            .handle(&c2, ClientEvent::join("u2", "alice", None))
            .await
            .unwrap();
        assert_eq!(router.resolve_connection("alice"), Some(c2));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (router, presence_store) = router();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let _i1 = router.connect(&c1);
        let mut i2 = router.connect(&c2);

        router
            .handle(&c1, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();
        router
            .handle(&c2, ClientEvent::join("u2", "bob", None))
            .await
            .unwrap();
        drain(&mut i2);

        router.disconnect(&c1).await;
        assert_eq!(names(&drain(&mut i2)), vec!["userLeft", "updateUserList"]);
        assert!(!presence_store.status("u1").unwrap().online);

        router.disconnect(&c1).await;
        assert!(drain(&mut i2).is_empty());
        assert!(!router.is_connected(&c1));
    }

    #[tokio::test]
    async fn test_events_after_disconnect_are_dropped() {
        let (router, _) = router();
        let conn = ConnectionId::from("c1");
        let _inbox = router.connect(&conn);

        router.disconnect(&conn).await;
        router
            .handle(&conn, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();

        assert!(router.session(&conn).is_none());
        assert!(router.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let (router, _) = router();
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let _i1 = router.connect(&c1);
        let _i2 = router.connect(&c2);

        router
            .handle(&c1, ClientEvent::join("u1", "alice", None))
            .await
            .unwrap();

        let stats = router.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.online_users, 1);
        // recentMessages to c1, updateUserList to c1 and c2
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.gateway_failures, 0);
    }
}
