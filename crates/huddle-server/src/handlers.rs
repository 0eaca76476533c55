//! Connection handlers for Huddle server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{anyhow, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{
    ConnectionId, EventRouter, Inbox, MemoryMessageStore, MemoryPresenceStore, MessageStore,
    PresenceStore,
};
use huddle_protocol::{codec, codes, ClientEvent, Encoding, ServerEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: EventRouter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state backed by in-memory stores.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_gateways(
            config,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryPresenceStore::new()),
        )
    }

    /// Create app state routing through the given gateways.
    #[must_use]
    pub fn with_gateways(
        config: Config,
        messages: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceStore>,
    ) -> Self {
        let router = EventRouter::with_config(messages, presence, config.router_config());
        Self { router, config }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/users", get(users_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let app = app(Arc::new(AppState::new(config)));

    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Presence list handler.
async fn users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "users": state.router.online_users() }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let connections = state.router.stats().connections;
    if connections >= state.config.limits.max_connections {
        warn!(connections, "Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Frames the reader hands to the connection's writer task.
enum Outgoing {
    /// Direct reply, encoded like the frame that caused it.
    Event(ServerEvent, Encoding),
    Pong(Vec<u8>),
}

type Replies = mpsc::UnboundedSender<Outgoing>;

/// Handle a WebSocket connection.
///
/// Reading and writing run on separate tasks so the connection's outbound
/// queue keeps draining while one of its own events waits on a gateway.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let inbox = state.router.connect(&connection_id);

    debug!(connection = %connection_id, "WebSocket connected");

    let (sender, mut receiver) = socket.split();

    // Replies follow the encoding of the most recent inbound frame
    let mut encoding = Encoding::Json;
    let (encoding_tx, encoding_rx) = watch::channel(encoding);

    let (replies, replies_rx) = mpsc::unbounded_channel();
    let connected = ServerEvent::connected(
        connection_id.as_str(),
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    // The writer sends queued replies before anything from the inbox
    let _ = replies.send(Outgoing::Event(connected, encoding));

    let mut writer = tokio::spawn(write_loop(
        sender,
        inbox,
        replies_rx,
        encoding_rx,
        connection_id.clone(),
    ));
    let mut writer_done = false;

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            _ = &mut writer => {
                writer_done = true;
                break;
            }

            () = &mut idle => {
                debug!(connection = %connection_id, "Heartbeat timeout");
                break;
            }

            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                let outcome = match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        encoding_tx.send_replace(encoding);
                        if text.len() > max_message_size {
                            reject_oversized(&replies, text.len(), encoding)
                        } else {
                            match codec::decode::<ClientEvent>(text.as_bytes(), Encoding::Json) {
                                Ok(event) => {
                                    process_event(event, &connection_id, &state, &replies, encoding).await
                                }
                                Err(e) => reject_malformed(&replies, &e, encoding),
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        encoding_tx.send_replace(encoding);
                        if data.len() > max_message_size {
                            reject_oversized(&replies, data.len(), encoding)
                        } else {
                            read_buffer.extend_from_slice(&data);
                            drain_binary(&mut read_buffer, &connection_id, &state, &replies).await
                        }
                    }
                    Some(Ok(Message::Ping(data))) => send_reply(&replies, Outgoing::Pong(data)),
                    Some(Ok(Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                if let Err(e) = outcome {
                    debug!(connection = %connection_id, error = %e, "Writer gone, closing");
                    break;
                }
            }
        }
    }

    // Closing the reply channel makes the writer send a close frame and stop
    drop(replies);
    state.router.disconnect(&connection_id).await;
    if !writer_done {
        let _ = writer.await;
    }
    metrics::record_router_stats(&state.router.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Write replies and routed events to the socket until the reader hangs up
/// or a write fails.
async fn write_loop(
    mut sender: WsSender,
    mut inbox: Inbox,
    mut replies: mpsc::UnboundedReceiver<Outgoing>,
    encoding: watch::Receiver<Encoding>,
    connection_id: ConnectionId,
) {
    loop {
        let result = tokio::select! {
            biased;

            outgoing = replies.recv() => match outgoing {
                Some(Outgoing::Event(event, encoding)) => {
                    send_event(&mut sender, &event, encoding).await
                }
                Some(Outgoing::Pong(data)) => {
                    sender.send(Message::Pong(data)).await.map_err(anyhow::Error::from)
                }
                None => break,
            },

            // Events routed to this connection
            Some(event) = inbox.recv() => {
                let current = *encoding.borrow();
                send_event(&mut sender, &event, current).await
            }
        };

        if let Err(e) = result {
            debug!(connection = %connection_id, error = %e, "Failed to write to client");
            return;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Decode and process every complete MessagePack frame in the buffer.
async fn drain_binary(
    read_buffer: &mut BytesMut,
    connection_id: &ConnectionId,
    state: &AppState,
    replies: &Replies,
) -> Result<()> {
    let max_message_size = state.config.limits.max_message_size;

    loop {
        // Refuse an oversized frame as soon as its prefix arrives
        if let Some(length) = codec::frame_length(read_buffer).filter(|&len| len > max_message_size) {
            read_buffer.clear();
            return reject_oversized(replies, length, Encoding::MessagePack);
        }

        match codec::decode_from::<ClientEvent>(read_buffer) {
            Ok(Some(event)) => {
                process_event(event, connection_id, state, replies, Encoding::MessagePack).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                read_buffer.clear();
                return reject_malformed(replies, &e, Encoding::MessagePack);
            }
        }
    }
}

/// Hand a decoded event to the router, answering rejections directly.
async fn process_event(
    event: ClientEvent,
    connection_id: &ConnectionId,
    state: &AppState,
    replies: &Replies,
    encoding: Encoding,
) -> Result<()> {
    let start = Instant::now();
    let kind = event.kind().as_str();
    metrics::record_event(kind);

    let outcome = state.router.handle(connection_id, event).await;

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::record_router_stats(&state.router.stats());

    if let Err(rejection) = outcome {
        debug!(connection = %connection_id, kind, error = %rejection, "Event rejected");
        metrics::record_rejection(kind);
        send_reply(replies, Outgoing::Event(rejection.to_event(), encoding))?;
    }

    Ok(())
}

fn reject_malformed(replies: &Replies, error: &codec::ProtocolError, encoding: Encoding) -> Result<()> {
    metrics::record_error("malformed");
    let event = ServerEvent::error(codes::MALFORMED, format!("Malformed event: {error}"));
    send_reply(replies, Outgoing::Event(event, encoding))
}

fn reject_oversized(replies: &Replies, size: usize, encoding: Encoding) -> Result<()> {
    metrics::record_error("oversized");
    let event = ServerEvent::error(codes::MALFORMED, format!("Frame of {size} bytes exceeds limit"));
    send_reply(replies, Outgoing::Event(event, encoding))
}

fn send_reply(replies: &Replies, outgoing: Outgoing) -> Result<()> {
    replies
        .send(outgoing)
        .map_err(|_| anyhow!("Writer task stopped"))
}

/// Send an event to the WebSocket.
async fn send_event(sender: &mut WsSender, event: &ServerEvent, encoding: Encoding) -> Result<()> {
    let data = codec::encode(event, encoding)?;
    metrics::record_outbound(data.len());

    let message = match encoding {
        Encoding::Json => Message::Text(String::from_utf8(data.to_vec())?),
        Encoding::MessagePack => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_core::{GatewayError, NewMessage};
    use huddle_protocol::ChatMessage;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Message store that takes `delay` to save anything.
    struct SlowStore {
        inner: MemoryMessageStore,
        delay: Duration,
    }

    #[async_trait]
    impl MessageStore for SlowStore {
        async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, GatewayError> {
            tokio::time::sleep(self.delay).await;
            self.inner.save_message(message).await
        }

        async fn fetch_recent(
            &self,
            room: &str,
            limit: usize,
        ) -> Result<Vec<ChatMessage>, GatewayError> {
            self.inner.fetch_recent(room, limit).await
        }
    }

    async fn spawn_server(config: Config) -> SocketAddr {
        spawn_app(AppState::new(config)).await
    }

    async fn spawn_app(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(Arc::new(state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        client
    }

    async fn send_json(client: &mut Client, event: &ClientEvent) {
        let text = serde_json::to_string(event).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn send_msgpack(client: &mut Client, event: &ClientEvent) {
        let data = codec::encode(event, Encoding::MessagePack).unwrap();
        client.send(WsMessage::Binary(data.to_vec())).await.unwrap();
    }

    /// Next server event with the encoding it arrived in.
    async fn next_event(client: &mut Client) -> (ServerEvent, Encoding) {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            match msg {
                WsMessage::Text(text) => {
                    return (serde_json::from_str(&text).unwrap(), Encoding::Json);
                }
                WsMessage::Binary(data) => {
                    return (
                        codec::decode(&data, Encoding::MessagePack).unwrap(),
                        Encoding::MessagePack,
                    );
                }
                _ => continue,
            }
        }
    }

    async fn expect_event(client: &mut Client, name: &str) -> ServerEvent {
        let (event, _) = next_event(client).await;
        assert_eq!(event.name(), name, "unexpected event {event:?}");
        event
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let addr = spawn_server(Config::default()).await;

        let mut alice = connect(addr).await;
        expect_event(&mut alice, "connected").await;
        send_json(&mut alice, &ClientEvent::join("u1", "alice", None)).await;
        expect_event(&mut alice, "recentMessages").await;
        expect_event(&mut alice, "updateUserList").await;

        let mut bob = connect(addr).await;
        expect_event(&mut bob, "connected").await;
        send_msgpack(&mut bob, &ClientEvent::join("u2", "bob", None)).await;

        let (recent, encoding) = next_event(&mut bob).await;
        assert_eq!(recent.name(), "recentMessages");
        assert_eq!(encoding, Encoding::MessagePack);
        expect_event(&mut bob, "updateUserList").await;

        let joined = expect_event(&mut alice, "userJoined").await;
        assert_eq!(joined, ServerEvent::user_joined("bob"));
        let ServerEvent::UpdateUserList { users } = expect_event(&mut alice, "updateUserList").await
        else {
            unreachable!()
        };
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);

        send_json(&mut alice, &ClientEvent::send_message("  hi  ", None)).await;

        for client in [&mut alice, &mut bob] {
            let ServerEvent::NewMessage(message) = expect_event(client, "newMessage").await else {
                unreachable!()
            };
            assert_eq!(message.content, "hi");
            assert_eq!(message.sender.username, "alice");
            assert_eq!(message.room, "general");
        }

        bob.close(None).await.unwrap();

        let left = expect_event(&mut alice, "userLeft").await;
        assert_eq!(left, ServerEvent::user_left("bob"));
        let ServerEvent::UpdateUserList { users } = expect_event(&mut alice, "updateUserList").await
        else {
            unreachable!()
        };
        assert_eq!(users, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_and_invalid_events_are_answered() {
        let addr = spawn_server(Config::default()).await;

        let mut client = connect(addr).await;
        expect_event(&mut client, "connected").await;

        client
            .send(WsMessage::Text("{\"event\":\"teleport\"}".to_string()))
            .await
            .unwrap();
        let ServerEvent::Error { code, .. } = expect_event(&mut client, "error").await else {
            unreachable!()
        };
        assert_eq!(code, codes::MALFORMED);

        send_json(&mut client, &ClientEvent::join("u1", "alice", Some("$system"))).await;
        let ServerEvent::Error { code, .. } = expect_event(&mut client, "error").await else {
            unreachable!()
        };
        assert_eq!(code, codes::INVALID_ROOM);

        // Connection stays usable after rejections
        send_json(&mut client, &ClientEvent::Ping { timestamp: Some(7) }).await;
        let pong = expect_event(&mut client, "pong").await;
        assert_eq!(pong, ServerEvent::Pong { timestamp: Some(7) });
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 64;
        let addr = spawn_server(config).await;

        let mut client = connect(addr).await;
        expect_event(&mut client, "connected").await;

        send_json(&mut client, &ClientEvent::send_message("x".repeat(200), None)).await;
        let ServerEvent::Error { code, .. } = expect_event(&mut client, "error").await else {
            unreachable!()
        };
        assert_eq!(code, codes::MALFORMED);
    }

    #[tokio::test]
    async fn test_forged_length_prefix_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 64;
        let addr = spawn_server(config).await;

        let mut client = connect(addr).await;
        expect_event(&mut client, "connected").await;

        // Small message announcing a frame far beyond the limit
        let mut data = 1_000_000u32.to_be_bytes().to_vec();
        data.extend_from_slice(&[0x80; 8]);
        client.send(WsMessage::Binary(data)).await.unwrap();

        let (event, encoding) = next_event(&mut client).await;
        assert_eq!(encoding, Encoding::MessagePack);
        let ServerEvent::Error { code, .. } = event else {
            panic!("Expected error, got {event:?}");
        };
        assert_eq!(code, codes::MALFORMED);

        // The buffer was reset, so the next frame decodes normally
        send_msgpack(&mut client, &ClientEvent::Ping { timestamp: Some(1) }).await;
        let pong = expect_event(&mut client, "pong").await;
        assert_eq!(pong, ServerEvent::Pong { timestamp: Some(1) });
    }

    #[tokio::test]
    async fn test_room_events_flow_while_own_save_is_pending() {
        let store = SlowStore {
            inner: MemoryMessageStore::new(),
            delay: Duration::from_secs(1),
        };
        let state = AppState::with_gateways(
            Config::default(),
            Arc::new(store),
            Arc::new(MemoryPresenceStore::new()),
        );
        let addr = spawn_app(state).await;

        let mut alice = connect(addr).await;
        expect_event(&mut alice, "connected").await;
        send_json(&mut alice, &ClientEvent::join("u1", "alice", None)).await;
        expect_event(&mut alice, "recentMessages").await;
        expect_event(&mut alice, "updateUserList").await;

        let mut bob = connect(addr).await;
        expect_event(&mut bob, "connected").await;
        send_json(&mut bob, &ClientEvent::join("u2", "bob", None)).await;
        expect_event(&mut bob, "recentMessages").await;
        expect_event(&mut bob, "updateUserList").await;
        expect_event(&mut alice, "userJoined").await;
        expect_event(&mut alice, "updateUserList").await;

        send_json(&mut alice, &ClientEvent::send_message("slow", None)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        send_json(
            &mut bob,
            &ClientEvent::Typing {
                is_typing: true,
                room: None,
                to: None,
            },
        )
        .await;

        // Arrives while alice's own message is still being saved
        let typing = tokio::time::timeout(Duration::from_millis(500), next_event(&mut alice))
            .await
            .expect("typing indicator held back by pending save")
            .0;
        assert_eq!(
            typing,
            ServerEvent::UserTyping {
                username: "bob".to_string(),
                is_typing: true
            }
        );

        let ServerEvent::NewMessage(message) = expect_event(&mut alice, "newMessage").await else {
            unreachable!()
        };
        assert_eq!(message.content, "slow");
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let mut config = Config::default();
        config.heartbeat.timeout_ms = 200;
        let addr = spawn_server(config).await;

        let mut client = connect(addr).await;
        expect_event(&mut client, "connected").await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "idle connection was not closed");
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_upgrade() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let addr = spawn_server(config).await;

        let mut first = connect(addr).await;
        expect_event(&mut first, "connected").await;

        let second = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
        assert!(second.is_err());
    }
}
