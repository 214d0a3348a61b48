//! Connection lifecycle
//!
//! `Connecting -> Joined -> Closed`. Every terminal path funnels through
//! [`Connection::close`], which deregisters the connection exactly once.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthGateway;
use crate::config::ChatServerConfig;
use crate::directory::RoomDirectory;
use crate::error::{ChatError, Result};
use crate::models::{ConnectionId, ConnectionState, Identity, RoomId, SharedEnvelope};
use crate::protocol::{close_code, encode_envelope};
use crate::registry::{MemberHandle, RoomRegistry};
use crate::router::MessageRouter;

/// Lifecycle state shared by a connection and its registry entry.
pub struct Lifecycle {
    state: AtomicU8,
    close_code: AtomicU16,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            close_code: AtomicU16::new(close_code::NORMAL),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting -> Joined`. Fails for a closed connection.
    pub fn mark_joined(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting.as_u8(),
                ConnectionState::Joined.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closed`. Returns true only for the call that performed the
    /// transition; `code` is recorded by that call alone.
    pub fn close(&self, code: u16) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed.as_u8(), Ordering::AcqRel);
        if ConnectionState::from_u8(previous) == ConnectionState::Closed {
            return false;
        }
        self.close_code.store(code, Ordering::Release);
        true
    }

    pub fn close_code(&self) -> u16 {
        self.close_code.load(Ordering::Acquire)
    }
}

/// Connection-side view of one authenticated, room-bound socket.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    room_id: RoomId,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<RoomRegistry>,
}

impl Connection {
    /// Allocate a connection in `Connecting` state.
    ///
    /// Returns the registry handle to pass to [`RoomRegistry::join`] and the
    /// receiving end of the bounded outbound queue.
    pub fn open(
        identity: Identity,
        room_id: impl Into<RoomId>,
        outbound_capacity: usize,
        registry: Arc<RoomRegistry>,
    ) -> (Self, MemberHandle, mpsc::Receiver<SharedEnvelope>) {
        let id = Uuid::new_v4();
        let lifecycle = Arc::new(Lifecycle::new());
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));

        let member = MemberHandle::new(id, identity.clone(), tx, lifecycle.clone());
        let connection = Self {
            id,
            identity,
            room_id: room_id.into(),
            lifecycle,
            registry,
        };
        (connection, member, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn close_code(&self) -> u16 {
        self.lifecycle.close_code()
    }

    pub(crate) fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Terminate the connection and deregister it.
    ///
    /// Safe to call from any number of concurrent error paths; only the first
    /// call reaches the registry.
    pub fn close(&self, code: u16) -> bool {
        if !self.lifecycle.close(code) {
            return false;
        }
        self.registry.leave(&self.room_id, self.id);
        debug!(conn_id = %self.id, room_id = %self.room_id, code, "Connection closed");
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(close_code::NORMAL);
    }
}

/// Handshake steps 3 and 4: resolve the identity, then confirm the room.
///
/// Each step is bounded by `step_timeout`; running out of time counts as the
/// step's own failure.
pub async fn handshake(
    gateway: &dyn AuthGateway,
    directory: &dyn RoomDirectory,
    token: &str,
    room_id: &str,
    step_timeout: Duration,
) -> Result<Identity> {
    let identity = match timeout(step_timeout, gateway.validate(token)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(room_id, "Handshake auth step timed out");
            return Err(ChatError::Unauthorized);
        }
    };

    match timeout(step_timeout, directory.exists(room_id)).await {
        Ok(Ok(true)) => Ok(identity),
        Ok(Ok(false)) => Err(ChatError::RoomNotFound),
        Ok(Err(e)) => {
            warn!(room_id, error = %e, "Room lookup failed");
            Err(ChatError::RoomNotFound)
        }
        Err(_) => {
            warn!(room_id, "Handshake room lookup timed out");
            Err(ChatError::RoomNotFound)
        }
    }
}

/// Drive an upgraded socket: join the room, then run the read loop here and
/// the write loop on its own task until either side terminates.
pub async fn accept(
    socket: WebSocket,
    identity: Identity,
    room_id: RoomId,
    registry: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
    config: Arc<ChatServerConfig>,
) {
    let (connection, member, outbound) = Connection::open(
        identity,
        room_id,
        config.outbound_buffer,
        registry.clone(),
    );
    let conn_id = connection.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(e) = registry.join(connection.room_id(), member).await {
        warn!(conn_id = %conn_id, room_id = %connection.room_id(), error = %e, "Join failed after upgrade");
        connection.close(e.close_code());
        let _ = ws_tx.send(close_message(e.close_code())).await;
        return;
    }

    info!(
        conn_id = %conn_id,
        room_id = %connection.room_id(),
        user_id = %connection.identity().user_id,
        "Connection joined"
    );

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        outbound,
        connection.lifecycle(),
        config.ping_interval,
    ));
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = timeout(config.idle_timeout, ws_rx.next()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(e) = router.handle(&connection, text.as_str()) {
                            warn!(conn_id = %conn_id, error = %e, "Inbound frame rejected");
                            if e.is_protocol_violation() {
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        connection.close(close_code::NORMAL);
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(conn_id = %conn_id, error = %e, "WebSocket read error");
                        connection.close(close_code::INTERNAL_ERROR);
                        break;
                    }
                    // pings are answered by the transport; pongs only refresh the idle timer
                    Ok(Some(Ok(_))) => {}
                    Err(_) => {
                        warn!(conn_id = %conn_id, "Connection idle timeout");
                        connection.close(close_code::POLICY_VIOLATION);
                        break;
                    }
                }
            }
            _ = &mut writer => {
                writer_done = true;
                connection.close(close_code::INTERNAL_ERROR);
                break;
            }
        }
    }

    // Dropping the registry entry ends the writer once the queue drains.
    connection.close(close_code::NORMAL);
    if !writer_done && timeout(Duration::from_secs(5), &mut writer).await.is_err() {
        writer.abort();
    }

    info!(conn_id = %conn_id, code = connection.close_code(), "Connection ended");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<SharedEnvelope>,
    lifecycle: Arc<Lifecycle>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    // removed from the registry
                    let _ = ws_tx.send(close_message(lifecycle.close_code())).await;
                    break;
                };
                let json = match encode_envelope(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn close_message(code: u16) -> Message {
    let reason = match code {
        close_code::NORMAL => "closed",
        close_code::POLICY_VIOLATION => "protocol violation",
        close_code::TRY_AGAIN_LATER => "slow consumer",
        close_code::ROOM_CLOSED => "room closed",
        close_code::UNAUTHORIZED => "unauthorized",
        _ => "server error",
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryRoomDirectory;
    use async_trait::async_trait;

    struct StaticGateway;

    #[async_trait]
    impl AuthGateway for StaticGateway {
        async fn validate(&self, token: &str) -> Result<Identity> {
            match token {
                "good" => Ok(Identity::new("u-1", "alice")),
                _ => Err(ChatError::Unauthorized),
            }
        }
    }

    struct StalledGateway;

    #[async_trait]
    impl AuthGateway for StalledGateway {
        async fn validate(&self, _token: &str) -> Result<Identity> {
            std::future::pending().await
        }
    }

    struct StalledDirectory;

    #[async_trait]
    impl RoomDirectory for StalledDirectory {
        async fn exists(&self, _room_id: &str) -> anyhow::Result<bool> {
            std::future::pending().await
        }
    }

    const STEP: Duration = Duration::from_millis(50);

    #[test]
    fn test_lifecycle_closes_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_joined());
        assert!(lifecycle.close(close_code::TRY_AGAIN_LATER));
        assert!(!lifecycle.close(close_code::NORMAL));
        assert_eq!(lifecycle.close_code(), close_code::TRY_AGAIN_LATER);
        assert!(!lifecycle.mark_joined());
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_lifecycle_joins_only_from_connecting() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(lifecycle.mark_joined());
        assert!(!lifecycle.mark_joined());
    }

    #[tokio::test]
    async fn test_handshake_resolves_identity() {
        let directory = InMemoryRoomDirectory::with_rooms(["r"]);
        let identity = handshake(&StaticGateway, &directory, "good", "r", STEP)
            .await
            .unwrap();
        assert_eq!(identity.display_name, "alice");
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_token_before_room_lookup() {
        let err = handshake(&StaticGateway, &StalledDirectory, "bad", "r", STEP)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_room() {
        let directory = InMemoryRoomDirectory::new();
        let err = handshake(&StaticGateway, &directory, "good", "r", STEP)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound));
    }

    #[tokio::test]
    async fn test_stalled_auth_times_out_as_unauthorized() {
        let directory = InMemoryRoomDirectory::with_rooms(["r"]);
        let err = handshake(&StalledGateway, &directory, "good", "r", STEP)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized));
    }

    #[tokio::test]
    async fn test_stalled_room_lookup_times_out_as_not_found() {
        let err = handshake(&StaticGateway, &StalledDirectory, "good", "r", STEP)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound));
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let directory = Arc::new(InMemoryRoomDirectory::with_rooms(["r"]));
        let registry = Arc::new(RoomRegistry::new(directory));
        let (connection, member, _rx) =
            Connection::open(Identity::new("u", "u"), "r", 4, registry.clone());
        registry.join("r", member).await.unwrap();
        assert_eq!(registry.member_count("r"), 1);

        drop(connection);
        assert_eq!(registry.member_count("r"), 0);
    }
}
