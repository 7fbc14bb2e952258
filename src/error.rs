//! Dispatch error taxonomy and its HTTP mapping.
//!
//! Every variant is raised before anything is written, so a failed call leaves
//! ride and presence records exactly as they were.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// No verified identity on the request.
    #[error("missing or malformed authentication context")]
    Unauthenticated,

    /// Role or ride ownership does not allow the call.
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A per-key lock could not be taken within the configured wait.
    #[error("resource busy, retry later")]
    Busy,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl DispatchError {
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Store(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Busy => "BUSY",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Busy | Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Busy,
            // lock_not_available: raised when lock_timeout expires
            sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03") => Self::Busy,
            _ => Self::Store(err.to_string()),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "dispatch request failed");
        }

        let body = json!({
            "error": self.to_string(),
            "code": self.error_code(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}
