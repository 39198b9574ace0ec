use crate::services::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use uuid::Uuid;

/// Error returned by every handler, rendered as a JSON body.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    /// Session the client should resume instead of opening a new one.
    pub session_id: Option<Uuid>,
    pub missing_indices: Option<Vec<u32>>,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            retryable: false,
            session_id: None,
            missing_indices: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
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
        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16(),
            "retryable": self.retryable,
        });
        if let Some(session_id) = self.session_id {
            body["sessionId"] = json!(session_id);
        }
        if let Some(missing) = self.missing_indices {
            body["missingIndices"] = json!(missing);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Validation(_) => StatusCode::BAD_REQUEST,
            UploadError::ChunkHashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::DuplicateSession { .. }
            | UploadError::AlreadyCompleting(_)
            | UploadError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            UploadError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            UploadError::Provider(_) => StatusCode::BAD_GATEWAY,
            UploadError::SessionNotFound(_) | UploadError::FileNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionAborted(_) | UploadError::SessionExpired(_) => StatusCode::GONE,
            UploadError::Configuration(_) | UploadError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }

        let mut app = AppError::new(status, err.code(), err.to_string());
        app.retryable = err.is_retryable();
        match err {
            UploadError::DuplicateSession { session_id } => app.session_id = Some(session_id),
            UploadError::IncompleteUpload { missing } => app.missing_indices = Some(missing),
            // Database internals stay in the log.
            UploadError::Database(_) => app.message = "database error".into(),
            _ => {}
        }
        app
    }
}
