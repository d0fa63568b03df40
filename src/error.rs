// Error handling module
// Defines the relay error taxonomy and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the authentication layer
#[derive(Error, Debug)]
pub enum RelayError {
    /// Login or registration rejected by the server
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The session can no longer be renewed and the user must sign in again
    #[error("Session expired, please sign in again")]
    SessionExpired,

    /// Transport-level failure (connection refused, timeout, ...)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Refresh endpoint returned a non-success status
    #[error("Token refresh failed: {status} - {message}")]
    RefreshFailed { status: u16, message: String },

    /// Durable credential storage failed
    #[error("Credential storage error: {0}")]
    Storage(anyhow::Error),

    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Short machine-readable kind, used in logs and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Authentication(_) => "authentication_error",
            RelayError::SessionExpired => "session_expired",
            RelayError::Network(_) => "network_error",
            RelayError::RefreshFailed { .. } => "refresh_failed",
            RelayError::Storage(_) => "storage_error",
            RelayError::Validation(_) => "validation_error",
            RelayError::Internal(_) => "internal_error",
        }
    }

    /// Whether this error should send the user back to a login entry point
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            RelayError::Authentication(_)
                | RelayError::SessionExpired
                | RelayError::RefreshFailed { .. }
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let error_type = self.kind();
        let (status, message) = match self {
            RelayError::Authentication(msg) => (StatusCode::UNAUTHORIZED, msg),
            RelayError::SessionExpired => (
                StatusCode::UNAUTHORIZED,
                "Session expired, please sign in again".to_string(),
            ),
            RelayError::RefreshFailed { status, message } => {
                tracing::warn!(status, "Surfacing refresh failure to client: {}", message);
                (
                    StatusCode::UNAUTHORIZED,
                    "Session expired, please sign in again".to_string(),
                )
            }
            RelayError::Network(err) => {
                tracing::error!("Upstream network error: {:?}", err);
                (StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {}", err))
            }
            RelayError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            RelayError::Storage(err) => {
                tracing::error!("Credential storage error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Credential storage unavailable".to_string(),
                )
            }
            RelayError::Internal(err) => {
                // Log internal errors
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
