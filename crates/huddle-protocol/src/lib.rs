//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle chat router.
//!
//! This crate defines the events exchanged between Huddle clients and the
//! server, the chat message model, and the codecs used on the wire.
//!
//! ## Events
//!
//! - `join` / `updateUserList` / `userJoined` / `userLeft` - Presence
//! - `sendMessage` / `newMessage` / `recentMessages` - Room messages
//! - `privateMessage` / `privateTyping` / `messageRead` - Direct messaging
//! - `error` - Rejections
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent, Encoding};
//!
//! let event = ClientEvent::send_message("Hello, world!", Some("general"));
//!
//! let encoded = codec::encode(&event, Encoding::MessagePack).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded, Encoding::MessagePack).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use events::{codes, ClientEvent, EventKind, ServerEvent, PROTOCOL_VERSION};
pub use types::{ChatMessage, MessageId, MessageType, SenderProfile};
