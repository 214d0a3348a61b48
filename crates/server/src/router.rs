//! Inbound frame router
//!
//! Validates one frame from one joined connection and hands it to the
//! registry for fan-out. Senders never receive their own messages.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{ChatError, Result};
use crate::models::{ConnectionState, Envelope};
use crate::protocol::InboundFrame;
use crate::registry::RoomRegistry;

pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Dispatch `raw` from `connection`. Returns the delivered count.
    ///
    /// Malformed frames and frames aimed at another room close the
    /// connection before the error is returned.
    pub fn handle(&self, connection: &Connection, raw: &str) -> Result<usize> {
        if connection.state() != ConnectionState::Joined {
            debug!(conn_id = %connection.id(), "Dropping frame from non-joined connection");
            return Ok(0);
        }

        let frame = match self.validate(connection, raw) {
            Ok(frame) => frame,
            Err(e) => {
                connection.close(e.close_code());
                return Err(e);
            }
        };

        let envelope = Envelope::new(frame.room_id, connection.identity(), frame.content, Utc::now());
        let delivered = self
            .registry
            .broadcast(connection.room_id(), envelope, Some(connection.id()));

        debug!(
            conn_id = %connection.id(),
            room_id = %connection.room_id(),
            delivered,
            "Message routed"
        );
        Ok(delivered)
    }

    fn validate(&self, connection: &Connection, raw: &str) -> Result<InboundFrame> {
        let frame = InboundFrame::parse(raw)?;
        if frame.room_id != connection.room_id() {
            return Err(ChatError::RoomMismatch {
                bound: connection.room_id().to_string(),
                requested: frame.room_id,
            });
        }
        Ok(frame)
    }
}
