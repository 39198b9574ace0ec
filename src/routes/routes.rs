//! HTTP routes.
//!
//! ## Structure
//! - **Chunked uploads**
//!   - `POST   /uploads`: open a session (or instant upload)
//!   - `GET    /uploads/{session_id}`: progress
//!   - `DELETE /uploads/{session_id}`: cancel
//!   - `POST   /uploads/{session_id}/chunks`: send one chunk
//!   - `POST   /uploads/{session_id}/complete`: finalize
//!   - `POST   /uploads/{session_id}/cancel`: cancel
//!
//! - **Files**
//!   - `POST   /files`: single-request upload
//!   - `GET    /files/{id}`: record
//!   - `GET    /files/{id}/content`: download
//!   - `DELETE /files/{id}`: soft delete
//!
//! - `GET /quota`, `GET /healthz`, `GET /readyz`

use crate::{
    gateway::ObjectGateway,
    handlers::{
        file_handlers::{delete_file, download_file, get_file, quota_report, upload_file},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, complete_upload, create_upload, upload_chunk, upload_status,
        },
    },
    services::{FileService, QuotaService, UploadService},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Room for multipart framing and the text fields around a chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub uploads: UploadService,
    pub files: FileService,
    pub quota: QuotaService,
    pub gateway: Arc<dyn ObjectGateway>,
}

impl AppState {
    /// Largest request body any route needs to accept.
    pub fn body_limit(&self) -> usize {
        let largest = self
            .uploads
            .settings()
            .max_chunk_size
            .max(self.files.max_small_upload());
        usize::try_from(largest)
            .unwrap_or(usize::MAX)
            .saturating_add(MULTIPART_OVERHEAD)
    }
}

/// Build the router for all routes, with the request body limit raised to `body_limit`.
pub fn routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // chunked uploads
        .route("/uploads", post(create_upload))
        .route(
            "/uploads/{session_id}",
            get(upload_status).delete(cancel_upload),
        )
        .route("/uploads/{session_id}/chunks", post(upload_chunk))
        .route("/uploads/{session_id}/complete", post(complete_upload))
        .route("/uploads/{session_id}/cancel", post(cancel_upload))
        // files
        .route("/files", post(upload_file))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/content", get(download_file))
        .route("/quota", get(quota_report))
        .layer(DefaultBodyLimit::max(body_limit))
}

/// The complete application with its state attached.
pub fn app(state: AppState) -> Router {
    routes(state.body_limit()).with_state(state)
}
