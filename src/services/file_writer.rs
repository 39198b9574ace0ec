//! Persists file records inside a caller's transaction.

use super::{dedup::FILE_COLUMNS, error::UploadResult, session_store::to_i64};
use crate::models::{FileRecord, NewFileRecord};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Writes the durable record for finished uploads. Stateless: the caller
/// owns the transaction so the record commits together with its quota delta.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileMetadataWriter;

impl FileMetadataWriter {
    pub async fn commit(
        &self,
        conn: &mut SqliteConnection,
        new: NewFileRecord,
        now: DateTime<Utc>,
    ) -> UploadResult<FileRecord> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO files (
                id, owner_id, name, size_bytes, content_hash, object_key,
                parent_id, is_deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {FILE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.owner_id)
        .bind(&new.name)
        .bind(to_i64(new.size)?)
        .bind(&new.content_hash)
        .bind(&new.object_key)
        .bind(new.parent_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        tracing::debug!(
            file_id = %record.id,
            owner_id = %record.owner_id,
            object_key = %record.object_key,
            "file record written"
        );
        Ok(record)
    }
}
