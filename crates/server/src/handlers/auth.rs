//! Auth handlers

use crate::auth::{bearer_token, UserInfo};
use crate::config::AppState;
use crate::error::{ChatError, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
}

/// POST /register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    info!("POST /register - {}", req.email);

    if req.email.trim().is_empty() || req.username.trim().is_empty() || req.password.is_empty() {
        return Err(ChatError::BadRequest(
            "email, username and password are required".to_string(),
        ));
    }

    match state.auth.signup(req.email.clone(), req.username, req.password).await {
        Ok(user) => Ok(Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
        })),
        Err(e) => {
            warn!("Registration failed for {}: {}", req.email, e);
            Err(ChatError::BadRequest(e.to_string()))
        }
    }
}

/// POST /login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    info!("POST /login - {}", req.email);

    match state.auth.login(req.email.clone(), req.password).await {
        Ok((user, session)) => Ok(Json(AuthResponse {
            token: session.token,
            user_id: user.id,
            username: user.username,
        })),
        Err(e) => {
            warn!("Login failed for {}: {}", req.email, e);
            Err(ChatError::Unauthorized)
        }
    }
}

/// POST /logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    info!("POST /logout");

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ChatError::Unauthorized)?;

    state.auth.logout(token).await.map_err(|e| {
        warn!("Logout failed: {}", e);
        ChatError::Internal("logout failed".to_string())
    })?;

    Ok(StatusCode::OK)
}

/// GET /user/{user_id}
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserInfo>> {
    info!("GET /user/{}", user_id);

    match state.auth.find_user(&user_id).await {
        Ok(Some(user)) => Ok(Json(user)),
        Ok(None) => Err(ChatError::UserNotFound),
        Err(e) => {
            error!("User lookup failed for {}: {}", user_id, e);
            Err(ChatError::Internal("database error".to_string()))
        }
    }
}
