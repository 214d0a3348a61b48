//! WebSocket upgrade endpoint
//!
//! Authentication and room lookup happen before the upgrade completes, so
//! a rejected handshake is an ordinary HTTP error response and never
//! allocates a connection.

use crate::auth::bearer_token;
use crate::config::AppState;
use crate::connection::{accept, handshake};
use crate::error::{ChatError, Result};
use crate::protocol::ConnectParams;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap},
    response::Response,
};
use tracing::{info, warn};

/// GET /ws/chat?token=..&room_id=..
pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token)
                .map(str::to_string)
        })
        .ok_or(ChatError::Unauthorized)?;

    let room_id = params
        .room_id
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ChatError::BadRequest("room_id is required".to_string()))?;

    let identity = handshake(
        state.gateway.as_ref(),
        state.directory.as_ref(),
        &token,
        &room_id,
        state.config.handshake_timeout,
    )
    .await
    .inspect_err(|e| warn!(room_id = %room_id, error = %e, "Handshake rejected"))?;

    info!(room_id = %room_id, user_id = %identity.user_id, "Handshake accepted, upgrading");

    let AppState {
        registry,
        router,
        config,
        ..
    } = state;
    Ok(ws.on_upgrade(move |socket| accept(socket, identity, room_id, registry, router, config)))
}
