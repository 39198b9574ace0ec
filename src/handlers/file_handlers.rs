//! File record endpoints and the quota report.
//! Downloads stream the object body through the gateway.

use super::OwnerId;
use crate::{
    errors::AppError,
    models::{FileRecord, QuotaReport},
    routes::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredFileResp {
    instant_upload: bool,
    file_record: FileRecord,
}

/// `POST /files`: single-request upload.
///
/// Multipart fields: `file` (with a filename), optional `parentId`.
pub async fn upload_file(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut parent_id: Option<Uuid> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("`file` field needs a filename"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                file = Some((file_name, data));
            }
            Some("parentId") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                let text = text.trim();
                if !text.is_empty() {
                    parent_id = Some(
                        Uuid::parse_str(text)
                            .map_err(|_| AppError::bad_request("parentId must be a UUID"))?,
                    );
                }
            }
            _ => {}
        }
    }

    let (name, data) = file.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    let stored = state
        .files
        .upload_small(owner_id, &name, parent_id, data)
        .await?;

    let status = if stored.instant {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(StoredFileResp {
            instant_upload: stored.instant,
            file_record: stored.record,
        }),
    ))
}

/// `GET /files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(state.files.get(owner_id, file_id).await?))
}

/// `GET /files/{id}/content`: stream the stored bytes.
pub async fn download_file(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (record, stream) = state.files.download(owner_id, file_id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    set_file_headers(response.headers_mut(), &record);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// `DELETE /files/{id}`: soft delete; the size goes back to the quota.
pub async fn delete_file(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.files.delete(owner_id, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /quota`
pub async fn quota_report(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
) -> Result<Json<QuotaReport>, AppError> {
    let ledger = state.quota.ensure_ledger(owner_id).await?;
    Ok(Json(ledger.report()))
}

fn set_file_headers(headers: &mut HeaderMap, record: &FileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&record.size().to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.content_hash)) {
        headers.insert(header::ETAG, value);
    }

    let ascii_name: String = record
        .name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{ascii_name}\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
