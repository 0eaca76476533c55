//! Room broadcaster for Huddle.
//!
//! Every live connection owns a bounded outbound queue. The broadcaster
//! resolves recipients from the session registry and pushes events onto
//! their queues without waiting, so a slow or closing recipient never holds
//! up the others.

use crate::session::{ConnectionId, SessionRegistry};
use dashmap::DashMap;
use huddle_protocol::ServerEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Arc<ServerEvent>>;

/// Receiving half of a connection's outbound queue, drained by the transport.
pub type Inbox = mpsc::Receiver<Arc<ServerEvent>>;

/// Create an outbound queue with the given capacity.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (Outbound, Inbox) {
    mpsc::channel(capacity.max(1))
}

/// Result of a delivery attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients whose queue accepted the event.
    pub delivered: usize,
    /// Recipients that were full, closed or no longer attached.
    pub dropped: usize,
}

/// Delivers events to rooms, single connections, or everyone.
pub struct RoomBroadcaster {
    /// Outbound queues of live connections.
    links: DashMap<ConnectionId, Outbound>,
    /// Source of room membership.
    sessions: Arc<SessionRegistry>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RoomBroadcaster {
    /// Create a broadcaster reading membership from `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            links: DashMap::new(),
            sessions,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a connection's outbound queue.
    pub fn attach(&self, connection_id: ConnectionId, outbound: Outbound) {
        debug!(connection = %connection_id, "Connection attached");
        self.links.insert(connection_id, outbound);
    }

    /// Detach a connection. Returns `true` if it was attached.
    pub fn detach(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.links.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Connection detached");
        }
        removed
    }

    /// Check if a connection is attached.
    #[must_use]
    pub fn is_attached(&self, connection_id: &ConnectionId) -> bool {
        self.links.contains_key(connection_id)
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Deliver an event to every member of `room`, optionally excluding one connection.
    pub fn deliver_to_room(
        &self,
        room: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> Delivery {
        let recipients = self.sessions.members_of(room);
        let event = Arc::new(event);
        let mut delivery = Delivery::default();

        for connection_id in recipients
            .iter()
            .filter(|id| Some(*id) != exclude)
        {
            self.push(connection_id, &event, &mut delivery);
        }

        trace!(
            room = %room,
            event = event.name(),
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Room delivery"
        );
        delivery
    }

    /// Deliver an event to one connection.
    ///
    /// Returns `false` if the connection is gone or its queue rejected the event.
    pub fn deliver_to_connection(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        let mut delivery = Delivery::default();
        self.push(connection_id, &Arc::new(event), &mut delivery);
        delivery.delivered == 1
    }

    /// Deliver an event to every attached connection.
    pub fn broadcast(&self, event: ServerEvent) -> Delivery {
        let recipients: Vec<ConnectionId> = self.links.iter().map(|e| e.key().clone()).collect();
        let event = Arc::new(event);
        let mut delivery = Delivery::default();

        for connection_id in &recipients {
            self.push(connection_id, &event, &mut delivery);
        }

        trace!(
            event = event.name(),
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Broadcast"
        );
        delivery
    }

    /// Total (delivered, dropped) counts since creation.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    fn push(
        &self,
        connection_id: &ConnectionId,
        event: &Arc<ServerEvent>,
        delivery: &mut Delivery,
    ) {
        let result = match self.links.get(connection_id) {
            Some(link) => link.try_send(Arc::clone(event)),
            None => {
                debug!(connection = %connection_id, event = event.name(), "Recipient no longer attached");
                delivery.dropped += 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match result {
            Ok(()) => {
                delivery.delivered += 1;
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                warn!(connection = %connection_id, event = event.name(), "Outbound queue full, dropping event");
                delivery.dropped += 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %connection_id, event = event.name(), "Outbound queue closed");
                delivery.dropped += 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
