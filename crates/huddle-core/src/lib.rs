//! # huddle-core
//!
//! Presence tracking and event routing for the Huddle chat router.
//!
//! This crate provides the routing core:
//!
//! - **Session** - Which user occupies which connection and room
//! - **Presence** - Which connection a username is reachable on
//! - **Broadcaster** - Delivery to rooms, single connections, or everyone
//! - **Router** - Per-connection state machine tying it all together
//! - **Gateway** - Interfaces to message and presence storage
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│ Broadcaster │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │    │              │
//!                       ▼    │    ▼              ▼
//!            ┌──────────┐    │   ┌──────────┐  ┌──────────┐
//!            │ Presence │    │   │ Gateways │  │ Sessions │
//!            └──────────┘    │   └──────────┘  └──────────┘
//!                            └──────────────────────▲
//! ```

pub mod broadcaster;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod presence;
pub mod router;
pub mod session;

pub use broadcaster::{Delivery, Inbox, Outbound, RoomBroadcaster};
pub use gateway::{GatewayError, MessageStore, NewMessage, PresenceStore, UserStatus};
pub use memory::{MemoryMessageStore, MemoryPresenceStore};
pub use presence::PresenceIndex;
pub use router::{EventRouter, RouterConfig, RouterError, RouterStats, UsernamePolicy};
pub use session::{ConnectionId, SessionInfo, SessionRegistry, DEFAULT_ROOM};
