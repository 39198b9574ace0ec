//! Content-hash lookups over live file records.

use super::error::UploadResult;
use crate::models::FileRecord;
use sqlx::SqlitePool;
use uuid::Uuid;

pub(crate) const FILE_COLUMNS: &str = "id, owner_id, name, size_bytes, content_hash, object_key, \
     parent_id, is_deleted, created_at, updated_at";

/// Answers "does this owner already have these bytes?".
#[derive(Clone)]
pub struct DedupChecker {
    db: SqlitePool,
}

impl DedupChecker {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Most recent non-deleted record of `owner_id` with `content_hash`.
    ///
    /// The hash is the client's claim; a match short-circuits the upload
    /// before any bytes move.
    pub async fn check_existing(
        &self,
        owner_id: Uuid,
        content_hash: &str,
    ) -> UploadResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_id = ? AND content_hash = ? AND is_deleted = 0
             ORDER BY julianday(created_at) DESC
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }

    /// The live record stored at `object_key`, if one was committed.
    pub async fn live_record_for_key(
        &self,
        owner_id: Uuid,
        object_key: &str,
    ) -> UploadResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_id = ? AND object_key = ? AND is_deleted = 0"
        ))
        .bind(owner_id)
        .bind(object_key)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }
}
