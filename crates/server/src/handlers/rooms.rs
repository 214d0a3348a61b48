//! Room directory and presence handlers
//!
//! Rooms are opaque to the chat core; these endpoints only manage the
//! directory entries and expose the registry's live member counts.

use crate::config::AppState;
use crate::directory::Room;
use crate::error::{ChatError, Result};
use crate::models::RoomPresence;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

/// POST /chat/rooms
///
/// Idempotent: succeeds if the room already exists.
pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>> {
    let room_id = req.room_id.trim();
    if room_id.is_empty() {
        return Err(ChatError::BadRequest("room_id is required".to_string()));
    }
    info!("POST /chat/rooms - {}", room_id);

    let room = state.rooms.create_room(room_id, None).await.map_err(|e| {
        error!("Failed to create room {}: {}", room_id, e);
        ChatError::Internal("failed to create room".to_string())
    })?;

    Ok(Json(CreateRoomResponse {
        room_id: room.room_id,
    }))
}

/// GET /chat/rooms
pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<Room>>> {
    let rooms = state.rooms.list_rooms().await?;
    Ok(Json(rooms))
}

/// DELETE /chat/rooms/{room_id}
///
/// Removes the directory entry, then force-closes every live connection in
/// the room.
pub async fn delete_room(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode> {
    info!("DELETE /chat/rooms/{}", room_id);

    if !state.rooms.delete_room(&room_id).await? {
        return Err(ChatError::RoomNotFound);
    }
    let closed = state.registry.close_room(&room_id);
    info!("Room {} deleted, {} connections closed", room_id, closed);

    Ok(StatusCode::NO_CONTENT)
}

/// GET /chat/rooms/{room_id}/presence
pub async fn get_presence(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Json<RoomPresence> {
    let online = state.registry.member_count(&room_id);
    Json(RoomPresence { room_id, online })
}
