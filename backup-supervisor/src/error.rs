use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_core::BackupError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    InsufficientStorage(String),

    /// Operation failed after starting; the message is shown to the caller.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<BackupError> for AppError {
    fn from(e: BackupError) -> Self {
        let message = e.to_string();
        match e {
            BackupError::SlugNotFound(_) => AppError::NotFound(message),
            BackupError::JobAlreadyInProgress(_) | BackupError::AlreadyFrozen => AppError::Conflict(message),
            BackupError::UnknownLocation(_)
            | BackupError::EmptySelection
            | BackupError::UnknownAddon(_)
            | BackupError::UnknownFolder(_)
            | BackupError::InvalidPassphrase(_)
            | BackupError::InvalidOption(_) => AppError::BadRequest(message),
            BackupError::CorruptArchive(_) => AppError::Unprocessable(message),
            BackupError::LocationUnavailable(_) => AppError::ServiceUnavailable(message),
            BackupError::InsufficientSpace { .. } => AppError::InsufficientStorage(message),
            BackupError::Cancelled
            | BackupError::RestoreIncomplete { .. }
            | BackupError::Component(_) => AppError::Failed(message),
            BackupError::Options(_) | BackupError::Io(_) | BackupError::Serialization(_) => {
                AppError::Internal(anyhow::Error::new(e))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::InsufficientStorage(m) => (StatusCode::INSUFFICIENT_STORAGE, m.clone()),
            AppError::Failed(m) => {
                tracing::error!("Operation failed: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "result": "error", "message": msg }))).into_response()
    }
}
