use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Typed failure taxonomy for delivery operations.
///
/// Collaborator errors inside a dispatch run are caught per record and never
/// surface through this type; owner-facing operations propagate it to the
/// HTTP layer, which maps each variant to a status code.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("owner identity required")]
    AuthRequired,
    #[error("{0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transport failure: {0}")]
    Transport(String),
    /// A guarded status update matched zero rows. Another runner already
    /// advanced the record; callers treat this as benign.
    #[error("conditional update matched no rows")]
    PreconditionFailed,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Unknown(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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

impl From<crate::services::object_store::ObjectError> for AppError {
    fn from(err: crate::services::object_store::ObjectError) -> Self {
        use crate::services::object_store::ObjectError;
        let status = match &err {
            ObjectError::NotFound(_) => StatusCode::NOT_FOUND,
            ObjectError::InvalidLocator => StatusCode::BAD_REQUEST,
            ObjectError::BadSignature => StatusCode::FORBIDDEN,
            ObjectError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        let status = match &err {
            DeliveryError::AuthRequired => StatusCode::UNAUTHORIZED,
            DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::Validation(_) => StatusCode::BAD_REQUEST,
            DeliveryError::Transport(_) => StatusCode::BAD_GATEWAY,
            DeliveryError::PreconditionFailed => StatusCode::CONFLICT,
            DeliveryError::Sqlx(_) | DeliveryError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}
