//! Wire protocol for the `/ws/chat` endpoint
//!
//! Inbound frames are JSON objects with `room_id` and `content`; unknown
//! fields are ignored. Outbound frames are serialized [`Envelope`]s.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::models::Envelope;

/// WebSocket close codes sent by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Outbound queue overflowed; the client should reconnect.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const ROOM_CLOSED: u16 = 4404;
}

/// Frame sent by a client into its room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub room_id: String,
    pub content: String,
}

impl InboundFrame {
    /// Parse a raw text frame. Missing or non-string fields are malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let frame: InboundFrame = serde_json::from_str(raw)?;
        if frame.room_id.is_empty() {
            return Err(ChatError::MalformedMessage("empty room_id".to_string()));
        }
        Ok(frame)
    }
}

/// Serialize an envelope as an outbound text frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| ChatError::Internal(e.to_string()))
}

/// Query parameters accepted by the upgrade endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub room_id: Option<String>,
}
