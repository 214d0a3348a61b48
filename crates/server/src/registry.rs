//! Room Registry
//!
//! Authoritative mapping from room id to the set of live member connections.
//! Each room carries its own lock; the outer map lock is only held long
//! enough to find or create a room entry, so rooms never contend with each
//! other on join, leave, or broadcast.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::Lifecycle;
use crate::directory::RoomDirectory;
use crate::error::{ChatError, Result};
use crate::models::{ConnectionId, ConnectionState, Envelope, Identity, RoomId, SharedEnvelope};
use crate::protocol::close_code;

/// Registry-side handle of a connection.
///
/// The registry holds the only sender of the connection's outbound queue, so
/// removing the member ends the connection's write task.
pub struct MemberHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: mpsc::Sender<SharedEnvelope>,
    lifecycle: Arc<Lifecycle>,
}

impl MemberHandle {
    pub(crate) fn new(
        id: ConnectionId,
        identity: Identity,
        tx: mpsc::Sender<SharedEnvelope>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            id,
            identity,
            tx,
            lifecycle,
        }
    }

    fn deliver(&self, envelope: &SharedEnvelope) -> Result<()> {
        self.tx
            .try_send(envelope.clone())
            .map_err(|e| ChatError::DeliveryFailure {
                conn_id: self.id,
                reason: match e {
                    TrySendError::Full(_) => "outbound buffer full".to_string(),
                    TrySendError::Closed(_) => "outbound channel closed".to_string(),
                },
            })
    }
}

/// Members of one room
#[derive(Default)]
struct RoomMembers {
    members: HashMap<ConnectionId, MemberHandle>,
    /// Set once the entry is unlinked from the registry map; joiners that
    /// raced the unlink must retry against a fresh entry.
    retired: bool,
}

type RoomEntry = Arc<RwLock<RoomMembers>>;

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RoomRegistry {
    directory: Arc<dyn RoomDirectory>,
    /// Bound on the directory lookup done by `join`
    lookup_timeout: Duration,
    rooms: RwLock<HashMap<RoomId, RoomEntry>>,
}

impl RoomRegistry {
    pub fn new(directory: Arc<dyn RoomDirectory>) -> Self {
        Self::with_lookup_timeout(directory, DEFAULT_LOOKUP_TIMEOUT)
    }

    pub fn with_lookup_timeout(directory: Arc<dyn RoomDirectory>, lookup_timeout: Duration) -> Self {
        Self {
            directory,
            lookup_timeout,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    fn room(&self, room_id: &str) -> Option<RoomEntry> {
        self.rooms.read().get(room_id).cloned()
    }

    fn room_or_insert(&self, room_id: &str) -> RoomEntry {
        if let Some(entry) = self.room(room_id) {
            return entry;
        }
        self.rooms
            .write()
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Register a connection under `room_id`.
    ///
    /// The member becomes visible to every broadcast that starts after this
    /// returns. Fails with `RoomNotFound` if the directory no longer knows
    /// the room or does not answer within the lookup timeout.
    pub async fn join(&self, room_id: &str, member: MemberHandle) -> Result<()> {
        match timeout(self.lookup_timeout, self.directory.exists(room_id)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(ChatError::RoomNotFound),
            Ok(Err(e)) => {
                warn!(room_id, error = %e, "[Registry] Room lookup failed on join");
                return Err(ChatError::RoomNotFound);
            }
            Err(_) => {
                warn!(room_id, "[Registry] Room lookup timed out on join");
                return Err(ChatError::RoomNotFound);
            }
        }

        let conn_id = member.id;
        loop {
            let entry = self.room_or_insert(room_id);
            let mut room = entry.write();
            if room.retired {
                continue;
            }
            // Transition under the room lock so a concurrent close either
            // happens before (join refused) or after (leave finds the member).
            if !member.lifecycle.mark_joined() {
                return Err(ChatError::Internal(format!(
                    "connection {} closed before join",
                    conn_id
                )));
            }
            room.members.insert(conn_id, member);
            debug!(room_id, conn_id = %conn_id, members = room.members.len(), "[Registry] Joined");
            return Ok(());
        }
    }

    /// Remove a connection from `room_id`. Idempotent.
    ///
    /// Returns whether the member was present.
    pub fn leave(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        let Some(entry) = self.room(room_id) else {
            return false;
        };

        let (removed, now_empty) = {
            let mut room = entry.write();
            let removed = room.members.remove(&conn_id);
            (removed, room.members.is_empty())
        };

        let Some(member) = removed else {
            return false;
        };
        member.lifecycle.close(close_code::NORMAL);
        debug!(room_id, conn_id = %conn_id, "[Registry] Left");
        drop(member);

        if now_empty {
            self.prune(room_id);
        }
        true
    }

    /// Unlink `room_id` from the map if it has no members.
    fn prune(&self, room_id: &str) {
        let mut rooms = self.rooms.write();
        let retire = match rooms.get(room_id) {
            Some(entry) => {
                let mut room = entry.write();
                room.retired = room.members.is_empty();
                room.retired
            }
            None => false,
        };
        if retire {
            rooms.remove(room_id);
        }
    }

    /// Send `envelope` to every current member of `room_id` except `exclude`.
    ///
    /// Never blocks on a member: a full or closed queue is a per-member
    /// delivery failure that removes that member. Returns the number of
    /// members the envelope was queued for.
    pub fn broadcast(
        &self,
        room_id: &str,
        envelope: Envelope,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let Some(entry) = self.room(room_id) else {
            return 0;
        };

        let envelope: SharedEnvelope = Arc::new(envelope);
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let room = entry.read();
            for (id, member) in room.members.iter() {
                // closed but not yet removed
                if Some(*id) == exclude || member.lifecycle.state() == ConnectionState::Closed {
                    continue;
                }
                match member.deliver(&envelope) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(room_id, error = %e, "[Registry] Delivery failed, removing member");
                        failed.push((*id, member.lifecycle.clone()));
                    }
                }
            }
        }

        for (id, lifecycle) in failed {
            if lifecycle.close(close_code::TRY_AGAIN_LATER) {
                self.leave(room_id, id);
            }
        }

        delivered
    }

    /// Force-remove every member of `room_id`, e.g. after the room was
    /// deleted from the directory. Returns the number of members removed.
    pub fn close_room(&self, room_id: &str) -> usize {
        let Some(entry) = self.rooms.write().remove(room_id) else {
            return 0;
        };

        let members = {
            let mut room = entry.write();
            room.retired = true;
            std::mem::take(&mut room.members)
        };

        let count = members.len();
        for member in members.into_values() {
            member.lifecycle.close(close_code::ROOM_CLOSED);
        }

        info!(room_id, removed = count, "[Registry] Room closed");
        count
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.room(room_id)
            .map(|entry| entry.read().members.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        self.room(room_id)
            .map(|entry| entry.read().members.contains_key(&conn_id))
            .unwrap_or(false)
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::directory::InMemoryRoomDirectory;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StalledDirectory;

    #[async_trait]
    impl RoomDirectory for StalledDirectory {
        async fn exists(&self, _room_id: &str) -> anyhow::Result<bool> {
            std::future::pending().await
        }
    }

    fn registry_with(rooms: &[&str]) -> Arc<RoomRegistry> {
        let directory = Arc::new(InMemoryRoomDirectory::with_rooms(rooms.iter().copied()));
        Arc::new(RoomRegistry::new(directory))
    }

    fn envelope(room_id: &str, content: &str) -> Envelope {
        Envelope::new(room_id, &Identity::new("u-0", "sender"), content, Utc::now())
    }

    async fn joined(
        registry: &Arc<RoomRegistry>,
        room_id: &str,
        name: &str,
        capacity: usize,
    ) -> (Connection, mpsc::Receiver<SharedEnvelope>) {
        let (conn, member, rx) =
            Connection::open(Identity::new(name, name), room_id, capacity, registry.clone());
        registry.join(room_id, member).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = registry_with(&["r"]);
        let (c1, mut rx1) = joined(&registry, "r", "alice", 8).await;
        let (_c2, mut rx2) = joined(&registry, "r", "bob", 8).await;

        let delivered = registry.broadcast("r", envelope("r", "Hello!"), Some(c1.id()));

        assert_eq!(delivered, 1);
        assert_eq!(rx2.try_recv().unwrap().content, "Hello!");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_is_room_scoped() {
        let registry = registry_with(&["r1", "r2"]);
        let (c1, _rx1) = joined(&registry, "r1", "alice", 8).await;
        let (_c3, mut rx3) = joined(&registry, "r2", "carol", 8).await;

        let delivered = registry.broadcast("r1", envelope("r1", "hi"), Some(c1.id()));

        assert_eq!(delivered, 0);
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_unknown_room_fails() {
        let registry = registry_with(&["r"]);
        let (conn, member, _rx) =
            Connection::open(Identity::new("u", "u"), "nope", 8, registry.clone());

        let err = registry.join("nope", member).await.unwrap_err();

        assert!(matches!(err, ChatError::RoomNotFound));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_gives_up_on_stalled_directory() {
        let registry = Arc::new(RoomRegistry::with_lookup_timeout(
            Arc::new(StalledDirectory),
            Duration::from_millis(50),
        ));
        let (conn, member, _rx) =
            Connection::open(Identity::new("u", "u"), "r", 8, registry.clone());

        let joined = timeout(Duration::from_secs(5), registry.join("r", member))
            .await
            .expect("join must not hang on the directory");

        assert!(matches!(joined, Err(ChatError::RoomNotFound)));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        let (c2, _rx2) = joined(&registry, "r", "bob", 8).await;

        assert!(registry.leave("r", c2.id()));
        assert!(!registry.leave("r", c2.id()));

        assert_eq!(registry.member_count("r"), 1);
        assert!(registry.contains("r", c1.id()));
        assert_eq!(c2.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_broadcast_after_disconnect_delivers_nothing() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        let (c2, _rx2) = joined(&registry, "r", "bob", 8).await;

        c2.close(close_code::NORMAL);

        assert_eq!(registry.broadcast("r", envelope("r", "anyone?"), Some(c1.id())), 0);
    }

    #[tokio::test]
    async fn test_closed_member_is_skipped_before_removal() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        let (c2, mut rx2) = joined(&registry, "r", "bob", 8).await;

        // lifecycle flipped, registry removal still pending
        assert!(c2.lifecycle().close(close_code::NORMAL));
        assert!(registry.contains("r", c2.id()));

        assert_eq!(registry.broadcast("r", envelope("r", "late"), Some(c1.id())), 0);
        assert!(rx2.try_recv().is_err());

        assert!(registry.leave("r", c2.id()));
    }

    #[tokio::test]
    async fn test_full_buffer_removes_member_without_aborting_fanout() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        let (slow, _slow_rx) = joined(&registry, "r", "slow", 1).await;
        let (_fast, mut fast_rx) = joined(&registry, "r", "fast", 8).await;

        assert_eq!(registry.broadcast("r", envelope("r", "one"), Some(c1.id())), 2);
        // slow's single slot is still occupied
        assert_eq!(registry.broadcast("r", envelope("r", "two"), Some(c1.id())), 1);

        assert!(!registry.contains("r", slow.id()));
        assert_eq!(slow.state(), ConnectionState::Closed);
        assert_eq!(slow.close_code(), close_code::TRY_AGAIN_LATER);
        assert_eq!(fast_rx.try_recv().unwrap().content, "one");
        assert_eq!(fast_rx.try_recv().unwrap().content, "two");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_delivery_failure() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        let (gone, gone_rx) = joined(&registry, "r", "gone", 8).await;
        drop(gone_rx);

        assert_eq!(registry.broadcast("r", envelope("r", "hi"), Some(c1.id())), 0);
        assert!(!registry.contains("r", gone.id()));
    }

    #[tokio::test]
    async fn test_per_sender_fifo() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 64).await;
        let (_c2, mut rx2) = joined(&registry, "r", "bob", 64).await;

        for i in 0..32 {
            registry.broadcast("r", envelope("r", &i.to_string()), Some(c1.id()));
        }
        for i in 0..32 {
            assert_eq!(rx2.try_recv().unwrap().content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_close_room_drops_outbound_queues() {
        let registry = registry_with(&["r"]);
        let (c1, mut rx1) = joined(&registry, "r", "alice", 8).await;
        let (c2, mut rx2) = joined(&registry, "r", "bob", 8).await;

        assert_eq!(registry.close_room("r"), 2);

        assert_eq!(registry.member_count("r"), 0);
        assert_eq!(c1.close_code(), close_code::ROOM_CLOSED);
        assert_eq!(c2.state(), ConnectionState::Closed);
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
        // the connection's own close path is now a no-op
        assert!(!c1.close(close_code::NORMAL));
    }

    #[tokio::test]
    async fn test_closed_connection_cannot_join() {
        let registry = registry_with(&["r"]);
        let (conn, member, _rx) =
            Connection::open(Identity::new("u", "u"), "r", 8, registry.clone());
        conn.close(close_code::NORMAL);

        assert!(registry.join("r", member).await.is_err());
        assert_eq!(registry.member_count("r"), 0);
    }

    #[tokio::test]
    async fn test_empty_rooms_are_pruned_and_rejoinable() {
        let registry = registry_with(&["r"]);
        let (c1, _rx1) = joined(&registry, "r", "alice", 8).await;
        c1.close(close_code::NORMAL);
        assert_eq!(registry.room_count(), 0);

        let (c2, _rx2) = joined(&registry, "r", "bob", 8).await;
        assert!(registry.contains("r", c2.id()));
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_keeps_member_set_consistent() {
        let registry = registry_with(&["r"]);
        let mut tasks = Vec::new();

        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("u{}", i);
                let (conn, member, rx) =
                    Connection::open(Identity::new(&name, &name), "r", 4, registry.clone());
                registry.join("r", member).await.unwrap();
                registry.broadcast("r", envelope("r", &name), Some(conn.id()));
                // odd connections disconnect, even ones stay
                if i % 2 == 1 {
                    conn.close(close_code::NORMAL);
                    assert!(!conn.close(close_code::NORMAL));
                }
                (conn, rx)
            }));
        }

        let mut live = Vec::new();
        for task in tasks {
            live.push(task.await.unwrap());
        }

        let expected: Vec<_> = live
            .iter()
            .filter(|(conn, _)| conn.state() == ConnectionState::Joined)
            .map(|(conn, _)| conn.id())
            .collect();
        assert_eq!(registry.member_count("r"), expected.len());
        for id in expected {
            assert!(registry.contains("r", id));
        }
    }
}
