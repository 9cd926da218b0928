use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures raised by the gateway core and its backends.
///
/// `NotFound` is deliberately coarse: a malformed entity path and a missing
/// object report the same variant so callers cannot tell them apart.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("unsupported signing method `{0}`")]
    UnsupportedMethod(String),
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("precondition failed for `{0}`")]
    PreconditionFailed(String),
    #[error("concurrent update conflict on `{0}`")]
    Conflict(String),
    #[error("capability url expired")]
    Expired,
    #[error("capability url signature mismatch")]
    InvalidSignature,
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Outward HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            StorageError::NotFound(_) | StorageError::InvalidPath(_) => StatusCode::NOT_FOUND,
            StorageError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            StorageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StorageError::Expired | StorageError::InvalidSignature => StatusCode::FORBIDDEN,
            StorageError::PreconditionFailed(_) | StorageError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            StorageError::Backend(_) => StatusCode::BAD_GATEWAY,
            StorageError::Configuration(_) | StorageError::Sqlx(_) | StorageError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden")
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = err.status();
        match &err {
            StorageError::NotFound(_) | StorageError::InvalidPath(_) => {
                AppError::not_found("Object not found")
            }
            StorageError::Configuration(_) => {
                tracing::error!(error = %err, "gateway misconfigured");
                AppError::internal("Internal server error")
            }
            StorageError::Sqlx(_) | StorageError::Io(_) | StorageError::Backend(_) => {
                tracing::error!(error = %err, "backend failure");
                AppError::new(status, "Storage backend failure")
            }
            _ => AppError::new(status, err.to_string()),
        }
    }
}
