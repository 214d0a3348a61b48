//! Error taxonomy for the chat core
//!
//! Handshake errors surface as rejected upgrades (HTTP status), steady-state
//! protocol errors close the socket with a close code, and delivery failures
//! never leave the registry.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::protocol::close_code;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    // Handshake
    #[error("unauthorized")]
    Unauthorized,
    #[error("room not found")]
    RoomNotFound,

    // Protocol violations
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("room mismatch: bound to {bound}, frame targets {requested}")]
    RoomMismatch { bound: String, requested: String },

    // Per-member, never returned from a broadcast
    #[error("delivery to {conn_id} failed: {reason}")]
    DeliveryFailure { conn_id: Uuid, reason: String },

    // Generic
    #[error("user not found")]
    UserNotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = core::result::Result<T, ChatError>;

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::RoomNotFound | ChatError::UserNotFound => StatusCode::NOT_FOUND,
            ChatError::MalformedMessage(_)
            | ChatError::RoomMismatch { .. }
            | ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::DeliveryFailure { .. } | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// WebSocket close code used when this error terminates a joined connection.
    pub fn close_code(&self) -> u16 {
        match self {
            ChatError::MalformedMessage(_) | ChatError::RoomMismatch { .. } => {
                close_code::POLICY_VIOLATION
            }
            ChatError::RoomNotFound => close_code::ROOM_CLOSED,
            ChatError::Unauthorized => close_code::UNAUTHORIZED,
            ChatError::DeliveryFailure { .. } => close_code::TRY_AGAIN_LATER,
            ChatError::UserNotFound | ChatError::BadRequest(_) | ChatError::Internal(_) => {
                close_code::INTERNAL_ERROR
            }
        }
    }

    /// Errors after which the connection must not read another frame.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ChatError::MalformedMessage(_) | ChatError::RoomMismatch { .. }
        )
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_errors_map_to_rejection_status() {
        assert_eq!(ChatError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChatError::RoomNotFound.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_protocol_violations_close_with_policy_code() {
        let mismatch = ChatError::RoomMismatch {
            bound: "a".to_string(),
            requested: "b".to_string(),
        };
        assert!(mismatch.is_protocol_violation());
        assert_eq!(mismatch.close_code(), close_code::POLICY_VIOLATION);

        let malformed = ChatError::MalformedMessage("eof".to_string());
        assert!(malformed.is_protocol_violation());
        assert_eq!(malformed.close_code(), close_code::POLICY_VIOLATION);

        assert!(!ChatError::Unauthorized.is_protocol_violation());
    }

    #[test]
    fn test_json_error_lifts_to_malformed() {
        let err: ChatError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ChatError::MalformedMessage(_)));
    }
}
