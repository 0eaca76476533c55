//! Presence tracking for Huddle.
//!
//! The presence index maps a display name to the connection it is reachable
//! on. It is derived from the session registry and is used to address
//! private messages, private typing indicators and read receipts.

use crate::session::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Username to connection mapping.
#[derive(Debug, Default)]
pub struct PresenceIndex {
    online: DashMap<String, ConnectionId>,
}

impl PresenceIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `username` as reachable on `connection_id` unless `keep` says
    /// the current holder must stay.
    ///
    /// The check and the write happen under the same entry lock.
    ///
    /// # Errors
    ///
    /// Returns the current holder when `keep` returned `true` for it.
    pub fn claim(
        &self,
        username: &str,
        connection_id: &ConnectionId,
        keep: impl FnOnce(&ConnectionId) -> bool,
    ) -> Result<Option<ConnectionId>, ConnectionId> {
        match self.online.entry(username.to_string()) {
            Entry::Occupied(mut entry) => {
                let holder = entry.get().clone();
                if holder == *connection_id {
                    return Ok(None);
                }
                if keep(&holder) {
                    return Err(holder);
                }
                entry.insert(connection_id.clone());
                debug!(username = %username, displaced = %holder, "Presence: username claimed");
                Ok(Some(holder))
            }
            Entry::Vacant(entry) => {
                entry.insert(connection_id.clone());
                Ok(None)
            }
        }
    }

    /// Get the connection a username is reachable on.
    #[must_use]
    pub fn resolve(&self, username: &str) -> Option<ConnectionId> {
        self.online.get(username).map(|c| c.value().clone())
    }

    /// Give up `username` on behalf of `connection_id`.
    ///
    /// Only acts if the mapping still points to `connection_id`. The mapping
    /// then moves to the connection returned by `successor`, or is removed if
    /// there is none. `successor` runs under the entry lock, so a connection
    /// that claims the name meanwhile is never overwritten.
    ///
    /// Returns the new holder, or `None` if the name went offline or was not
    /// held by `connection_id`.
    pub fn release(
        &self,
        username: &str,
        connection_id: &ConnectionId,
        successor: impl FnOnce() -> Option<ConnectionId>,
    ) -> Option<ConnectionId> {
        let Entry::Occupied(mut entry) = self.online.entry(username.to_string()) else {
            return None;
        };
        if entry.get() != connection_id {
            return None;
        }

        match successor() {
            Some(next) => {
                debug!(username = %username, from = %connection_id, to = %next, "Presence: username handed over");
                entry.insert(next.clone());
                Some(next)
            }
            None => {
                entry.remove();
                debug!(username = %username, connection = %connection_id, "Presence: user went offline");
                None
            }
        }
    }

    /// Snapshot of every mapping.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, ConnectionId)> {
        self.online
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of reachable usernames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.online.len()
    }

    /// Check if nobody is reachable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}
