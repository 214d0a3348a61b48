use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Room identifiers are opaque strings owned by the room directory.
pub type RoomId = String;

/// Unique id assigned to every accepted connection.
pub type ConnectionId = Uuid;

/// Authenticated user, resolved once per connection at handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Server-constructed message unit delivered to room members.
///
/// Serializes directly as the outbound wire frame; `content` is passed
/// through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub room_id: RoomId,
    pub content: String,
    pub user_id: String,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        room_id: impl Into<RoomId>,
        sender: &Identity,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            content: content.into(),
            user_id: sender.user_id.clone(),
            display_name: sender.display_name.clone(),
            timestamp,
        }
    }
}

/// Shared across every member queue of one broadcast.
pub type SharedEnvelope = Arc<Envelope>;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Joined,
    Closed,
}

impl ConnectionState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Joined => 1,
            ConnectionState::Closed => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Joined,
            _ => ConnectionState::Closed,
        }
    }
}

/// Room presence snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPresence {
    pub room_id: RoomId,
    pub online: usize,
}
