//! Room-scoped chat server
//!
//! Clients authenticate, join one room over a WebSocket, and every message
//! they send is fanned out to the other members of that room.

pub mod auth;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod router;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppState, ChatServerConfig};
use handlers::{
    // Chat socket
    chat_socket,
    // Rooms
    create_room,
    delete_room,
    get_presence,
    list_rooms,
    // Auth
    get_user,
    login,
    logout,
    register,
};

pub use error::{ChatError, Result};

/// Install the global fmt subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Already set (tests, embedding), ignore
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Build the HTTP router over `state`.
pub fn app(state: AppState) -> Router {
    Router::new()
        // Auth endpoints
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/user/{user_id}", get(get_user))
        // Room directory
        .route("/chat/rooms", get(list_rooms).post(create_room))
        .route("/chat/rooms/{room_id}", delete(delete_room))
        .route("/chat/rooms/{room_id}/presence", get(get_presence))
        // Chat socket
        .route("/ws/chat", get(chat_socket))
        // Health check
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve `state` on an already bound listener until the server stops.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = ChatServerConfig::from_env();
    info!("=== Chat Server ===");
    info!("Data directory: {:?}", config.data_dir);
    info!(
        "Outbound buffer: {} | handshake timeout: {:?} | ping: {:?} | idle: {:?}",
        config.outbound_buffer, config.handshake_timeout, config.ping_interval, config.idle_timeout
    );

    let addr = config.bind_addr;
    let state = AppState::initialize(config).await?;
    info!("Auth Manager and Room Store initialized");

    let listener = TcpListener::bind(addr).await?;
    info!("Chat server listening on {}", addr);

    serve(listener, state).await
}

async fn health_check() -> &'static str {
    "OK - Chat Server"
}
