//! Single-shot uploads, downloads and soft deletes of file records.

use super::{
    bounded,
    dedup::{DedupChecker, FILE_COLUMNS},
    error::{UploadError, UploadResult},
    file_writer::FileMetadataWriter,
    quota::QuotaService,
    session_store::to_i64,
};
use crate::{
    gateway::{ByteStream, ObjectGateway},
    hashing::sha256_hex,
    models::{FileRecord, NewFileRecord, file::object_key_for},
};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of the small-file path.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub record: FileRecord,
    /// Identical content was already stored; no bytes were written.
    pub instant: bool,
}

#[derive(Clone)]
pub struct FileService {
    db: SqlitePool,
    gateway: Arc<dyn ObjectGateway>,
    quota: QuotaService,
    dedup: DedupChecker,
    writer: FileMetadataWriter,
    max_small_upload: u64,
    provider_timeout: Duration,
}

impl FileService {
    pub fn new(
        db: SqlitePool,
        gateway: Arc<dyn ObjectGateway>,
        quota: QuotaService,
        max_small_upload: u64,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            dedup: DedupChecker::new(db.clone()),
            writer: FileMetadataWriter,
            db,
            gateway,
            quota,
            max_small_upload,
            provider_timeout,
        }
    }

    pub fn max_small_upload(&self) -> u64 {
        self.max_small_upload
    }

    /// Store a whole file in one request.
    #[instrument(skip(self, name, data), fields(size = data.len()))]
    pub async fn upload_small(
        &self,
        owner_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
        data: Bytes,
    ) -> UploadResult<StoredFile> {
        let name = super::upload_service::validate_name(name)?;
        let size = data.len() as u64;
        if size > self.max_small_upload {
            return Err(UploadError::Validation(format!(
                "file of {size} bytes exceeds the single-request limit of {}; use a chunked upload",
                self.max_small_upload
            )));
        }
        let delta = to_i64(size)?;

        let content_hash = sha256_hex(&data);
        if let Some(existing) = self.dedup.check_existing(owner_id, &content_hash).await? {
            info!(file_id = %existing.id, "instant upload: content already stored");
            return Ok(StoredFile {
                record: existing,
                instant: true,
            });
        }

        if !self.quota.reserve_if_fits(owner_id, size).await? {
            return Err(UploadError::QuotaExceeded {
                requested: size,
                available: self.quota.available_space(owner_id).await?,
            });
        }

        let object_key = object_key_for(owner_id, parent_id, Uuid::new_v4(), &name);
        bounded(
            self.provider_timeout,
            "put",
            self.gateway.put(&object_key, data),
        )
        .await?;

        let committed = async {
            let now = Utc::now();
            let mut tx = self.db.begin().await?;
            self.quota.apply_delta(&mut tx, owner_id, delta, now).await?;
            let record = self
                .writer
                .commit(
                    &mut tx,
                    NewFileRecord {
                        owner_id,
                        name,
                        parent_id,
                        object_key: object_key.clone(),
                        content_hash,
                        size,
                    },
                    now,
                )
                .await?;
            tx.commit().await?;
            Ok::<_, UploadError>(record)
        }
        .await;

        match committed {
            Ok(record) => {
                info!(file_id = %record.id, object_key = %record.object_key, "file stored");
                Ok(StoredFile {
                    record,
                    instant: false,
                })
            }
            Err(err) => {
                if let Err(delete_err) =
                    bounded(self.provider_timeout, "delete", self.gateway.delete(&object_key)).await
                {
                    warn!(object_key = %object_key, error = %delete_err, "failed to delete orphaned object");
                }
                Err(err)
            }
        }
    }

    /// A live file of `owner_id`.
    pub async fn get(&self, owner_id: Uuid, file_id: Uuid) -> UploadResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND owner_id = ? AND is_deleted = 0"
        ))
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(UploadError::FileNotFound(file_id))
    }

    /// Record plus a stream of its bytes.
    pub async fn download(
        &self,
        owner_id: Uuid,
        file_id: Uuid,
    ) -> UploadResult<(FileRecord, ByteStream)> {
        let record = self.get(owner_id, file_id).await?;
        let stream = bounded(
            self.provider_timeout,
            "get",
            self.gateway.get(&record.object_key),
        )
        .await?;
        Ok((record, stream))
    }

    /// Soft-delete a file and return its size to the owner's quota.
    ///
    /// The stored object is kept; only the record is hidden.
    #[instrument(skip(self))]
    pub async fn delete(&self, owner_id: Uuid, file_id: Uuid) -> UploadResult<FileRecord> {
        // Make sure the refund has a row to land on.
        self.quota.ensure_ledger(owner_id).await?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET is_deleted = 1, updated_at = ?
             WHERE id = ? AND owner_id = ? AND is_deleted = 0
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(now)
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(UploadError::FileNotFound(file_id))?;

        self.quota
            .apply_delta(&mut tx, owner_id, -record.size_bytes, now)
            .await?;
        tx.commit().await?;

        info!(file_id = %file_id, size = record.size_bytes, "file deleted");
        Ok(record)
    }
}
