use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[allow(dead_code)]
    #[error("Rate limited")]
    RateLimited,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

// ─── Wire-level protocol errors ─────────────────────────────────────────────

/// Errors surfaced to a WebSocket peer as an `error` frame (§7). None of these
/// close the connection — they are reported and the connection stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Already authenticated or named on this connection")]
    AlreadyNamed,

    #[error("Anonymous screen names are disabled on this server")]
    AnonymousDisabled,

    #[error("Invalid screen name")]
    NameInvalid,

    #[error("Screen name already in use")]
    NameTaken,

    #[error("Invalid channel — must be a number between 1 and 999")]
    InvalidChannel,

    #[error("Not currently in a channel")]
    NotInChannel,

    #[error("Internal store error")]
    InternalStoreError,
}

impl ProtocolError {
    /// Short machine-readable code, where the spec assigns one (§7). Frames
    /// without a listed code omit the `code` field entirely.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProtocolError::NameTaken => Some("screen_name_taken"),
            _ => None,
        }
    }
}
