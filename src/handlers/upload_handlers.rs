//! Chunked upload endpoints.
//!
//! - `POST   /uploads`                     open a session (or instant upload)
//! - `POST   /uploads/{session_id}/chunks`   send one chunk (multipart)
//! - `GET    /uploads/{session_id}`          progress for resuming clients
//! - `POST   /uploads/{session_id}/complete` finalize into a file record
//! - `POST   /uploads/{session_id}/cancel`   abort (also `DELETE /uploads/{session_id}`)

use super::OwnerId;
use crate::{
    errors::AppError,
    models::{FileRecord, UploadProgress},
    routes::AppState,
    services::upload_service::{CreateOutcome, CreateSessionRequest},
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadReq {
    pub file_name: String,
    pub total_size: u64,
    pub content_hash: String,
    pub chunk_size: u64,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CreateUploadResp {
    #[serde(rename_all = "camelCase")]
    Instant {
        instant_upload: bool,
        file_record: FileRecord,
    },
    #[serde(rename_all = "camelCase")]
    Session {
        instant_upload: bool,
        session_id: Uuid,
        chunk_count: u32,
        chunk_size: u64,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkAcceptedResp {
    accepted: bool,
    index: u32,
    part_tag: String,
    duplicate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResp {
    file_record: FileRecord,
}

/// `POST /uploads`
pub async fn create_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Json(req): Json<CreateUploadReq>,
) -> Result<Response, AppError> {
    let outcome = state
        .uploads
        .create(CreateSessionRequest {
            owner_id,
            file_name: req.file_name,
            total_size: req.total_size,
            content_hash: req.content_hash,
            chunk_size: req.chunk_size,
            parent_id: req.parent_id,
        })
        .await?;

    let response = match outcome {
        CreateOutcome::Instant(file_record) => (
            StatusCode::OK,
            Json(CreateUploadResp::Instant {
                instant_upload: true,
                file_record,
            }),
        )
            .into_response(),
        CreateOutcome::Created(ticket) => (
            StatusCode::CREATED,
            Json(CreateUploadResp::Session {
                instant_upload: false,
                session_id: ticket.session_id,
                chunk_count: ticket.chunk_count,
                chunk_size: ticket.chunk_size,
                expires_at: ticket.expires_at,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// `POST /uploads/{session_id}/chunks`
///
/// Multipart fields: `index`, `chunkHash`, `chunk`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut index: Option<u32> = None;
    let mut chunk_hash: Option<String> = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                index = Some(text.trim().parse().map_err(|_| {
                    AppError::bad_request("index must be a non-negative integer")
                })?);
            }
            Some("chunkHash") => {
                chunk_hash = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            Some("chunk") => {
                chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let index = index.ok_or_else(|| AppError::bad_request("missing `index` field"))?;
    let chunk_hash = chunk_hash.ok_or_else(|| AppError::bad_request("missing `chunkHash` field"))?;
    let chunk = chunk.ok_or_else(|| AppError::bad_request("missing `chunk` field"))?;

    let receipt = state
        .uploads
        .accept_chunk(owner_id, session_id, index, chunk, &chunk_hash)
        .await?;

    Ok(Json(ChunkAcceptedResp {
        accepted: true,
        index: receipt.index,
        part_tag: receipt.part_tag,
        duplicate: receipt.duplicate,
    }))
}

/// `GET /uploads/{session_id}`
pub async fn upload_status(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(session_id): Path<Uuid>,
) -> Result<Json<UploadProgress>, AppError> {
    let progress = state
        .uploads
        .completion_status(owner_id, session_id)
        .await?;
    Ok(Json(progress))
}

/// `POST /uploads/{session_id}/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let file_record = state.uploads.complete(owner_id, session_id).await?;
    Ok(Json(CompleteResp { file_record }))
}

/// `POST /uploads/{session_id}/cancel` and `DELETE /uploads/{session_id}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.cancel(owner_id, session_id).await?;
    Ok(Json(json!({})))
}
