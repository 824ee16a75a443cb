//! HTTP error mapping.
//!
//! Everything below the HTTP layer returns typed errors; this is the
//! single place they become status codes and the `{error}` wire shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<mikroscope_index::IndexError> for AppError {
    fn from(err: mikroscope_index::IndexError) -> Self {
        match err {
            mikroscope_index::IndexError::InvalidQuery(message) => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<mikroscope_alerts::AlertError> for AppError {
    fn from(err: mikroscope_alerts::AlertError) -> Self {
        use mikroscope_alerts::AlertError;
        match err {
            AlertError::Validation(message) => Self::bad_request(message),
            AlertError::NoWebhookUrl => Self::bad_request("no webhook URL configured"),
            other => Self::internal(other.to_string()),
        }
    }
}
