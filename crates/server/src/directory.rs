//! Room Directory
//!
//! Rooms are created and deleted out-of-band; the chat core only asks
//! whether a room exists before admitting a connection.
//! The SQLite-backed store lives in the same database as auth (chat.sqlite).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::info;

/// Existence check consulted once per handshake and again on join.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn exists(&self, room_id: &str) -> Result<bool>;
}

/// Room record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// SQLite room store
pub struct RoomStore {
    pool: SqlitePool,
}

impl RoomStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_db().await?;
        info!("[Rooms] Initialized");
        Ok(store)
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                created_by TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create rooms table")?;

        Ok(())
    }

    /// Create a room. Idempotent: an existing room is returned unchanged.
    pub async fn create_room(&self, room_id: &str, created_by: Option<&str>) -> Result<Room> {
        if let Some(room) = self.get_room(room_id).await? {
            return Ok(room);
        }

        let room = Room {
            room_id: room_id.to_string(),
            created_by: created_by.map(str::to_string),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT OR IGNORE INTO rooms (room_id, created_by, created_at) VALUES (?, ?, ?)")
            .bind(&room.room_id)
            .bind(&room.created_by)
            .bind(room.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        info!("[Rooms] Created room {}", room_id);
        Ok(room)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let row: Option<(String, Option<String>, String)> =
            sqlx::query_as("SELECT room_id, created_by, created_at FROM rooms WHERE room_id = ?")
                .bind(room_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(room_id, created_by, created_at)| Room {
            room_id,
            created_by,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Delete a room. Returns false if it did not exist.
    pub async fn delete_room(&self, room_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rooms WHERE room_id = ?")
            .bind(room_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!("[Rooms] Deleted room {}", room_id);
        }
        Ok(deleted)
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        let rows: Vec<(String, Option<String>, String)> =
            sqlx::query_as("SELECT room_id, created_by, created_at FROM rooms ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(room_id, created_by, created_at)| Room {
                room_id,
                created_by,
                created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }
}

#[async_trait]
impl RoomDirectory for RoomStore {
    async fn exists(&self, room_id: &str) -> Result<bool> {
        Ok(self.get_room(room_id).await?.is_some())
    }
}

/// In-process directory for embedding the core without a database
#[derive(Default)]
pub struct InMemoryRoomDirectory {
    rooms: RwLock<HashSet<String>>,
}

impl InMemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rooms: RwLock::new(rooms.into_iter().map(Into::into).collect()),
        }
    }

    pub fn create_room(&self, room_id: impl Into<String>) {
        self.rooms.write().insert(room_id.into());
    }

    pub fn delete_room(&self, room_id: &str) -> bool {
        self.rooms.write().remove(room_id)
    }
}

#[async_trait]
impl RoomDirectory for InMemoryRoomDirectory {
    async fn exists(&self, room_id: &str) -> Result<bool> {
        Ok(self.rooms.read().contains(room_id))
    }
}
