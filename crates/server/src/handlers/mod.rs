//! HTTP and WebSocket handlers

pub mod auth;
pub mod rooms;
pub mod ws;

// Re-export AppState from config
pub use crate::config::AppState;

// Auth handlers
pub use auth::{get_user, login, logout, register};

// Room directory and presence
pub use rooms::{create_room, delete_room, get_presence, list_rooms};

// Chat socket
pub use ws::chat_socket;
