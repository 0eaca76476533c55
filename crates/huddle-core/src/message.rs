//! Chat message rules for Huddle.
//!
//! Validation applied before anything is persisted or broadcast.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum message content length, in characters.
pub const MAX_CONTENT_LENGTH: usize = 1000;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Trim and validate message content.
///
/// # Errors
///
/// Returns an error message if the content is empty or too long.
pub fn normalize_content(content: &str) -> Result<&str, &'static str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("Message content cannot be empty");
    }
    if trimmed.chars().count() > MAX_CONTENT_LENGTH {
        return Err("Message content too long");
    }
    Ok(trimmed)
}
