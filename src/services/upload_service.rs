//! Upload session manager.
//!
//! Orchestrates the chunked-upload lifecycle on top of the session store,
//! the dedup checker, the quota ledger and the object gateway:
//!
//! - `create`: dedup short-circuit, advisory quota check, provider initiate.
//! - `accept_chunk`: per-chunk SHA-256 check, provider upload-part, idempotent record.
//! - `completion_status`: progress for resuming clients.
//! - `complete`: CAS `Uploading -> Completing` under a lease, provider complete,
//!   then one transaction for the quota delta and the file record.
//! - `cancel` / `reap_expired`: abort at the provider (best-effort) and forget;
//!   the reaper also finishes completions interrupted after the provider step.
//!
//! No state lives in memory between requests; every guard is a SQL condition.

use super::{
    bounded,
    dedup::DedupChecker,
    error::{UploadError, UploadResult},
    file_writer::FileMetadataWriter,
    quota::QuotaService,
    session_store::{SessionStore, to_i64},
};
use crate::{
    gateway::{GatewayError, GatewayResult, ObjectGateway},
    hashing::{normalize_sha256, sha256_hex},
    models::{
        ChunkPlan, FileRecord, NewFileRecord, ReceivedPart, SessionStatus, UploadProgress,
        UploadSession, file::object_key_for,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Longest accepted file name, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Shortest hold a completion keeps on its session.
const MIN_COMPLETION_LEASE: Duration = Duration::from_secs(60);

/// Tunables for the session manager.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Idle lifetime of a session; refreshed by every accepted chunk.
    pub session_ttl: Duration,
    /// Upper bound on any single object-store call.
    pub provider_timeout: Duration,
    pub max_chunk_size: u64,
    /// Provider limit on parts per multipart upload.
    pub max_chunks: u32,
    /// Sessions examined per reaper pass.
    pub reap_batch: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            provider_timeout: Duration::from_secs(30),
            max_chunk_size: 64 * 1024 * 1024,
            max_chunks: 10_000,
            reap_batch: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub owner_id: Uuid,
    pub file_name: String,
    pub total_size: u64,
    pub content_hash: String,
    pub chunk_size: u64,
    pub parent_id: Option<Uuid>,
}

/// What the client should send next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    pub session_id: Uuid,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Identical content already stored for this owner; nothing to upload.
    Instant(FileRecord),
    Created(SessionTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub index: u32,
    pub part_tag: String,
    /// The chunk was already recorded with the same hash.
    pub duplicate: bool,
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub examined: usize,
    pub reaped: usize,
    /// Interrupted completions finished into a file record.
    pub recovered: usize,
    pub abort_failures: usize,
}

#[derive(Clone)]
pub struct UploadService {
    db: SqlitePool,
    sessions: SessionStore,
    dedup: DedupChecker,
    quota: QuotaService,
    writer: FileMetadataWriter,
    gateway: Arc<dyn ObjectGateway>,
    settings: UploadSettings,
}

impl UploadService {
    pub fn new(
        db: SqlitePool,
        gateway: Arc<dyn ObjectGateway>,
        quota: QuotaService,
        settings: UploadSettings,
    ) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            dedup: DedupChecker::new(db.clone()),
            writer: FileMetadataWriter,
            db,
            quota,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Run a provider call under the configured timeout.
    async fn provider<T, F>(&self, operation: &'static str, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        bounded(self.settings.provider_timeout, operation, call).await
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> UploadResult<DateTime<Utc>> {
        chrono::Duration::from_std(self.settings.session_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| UploadError::Configuration("session TTL is out of range".into()))
    }

    /// A session visible to `owner_id`. Other owners' sessions do not exist for them.
    async fn load_owned(&self, owner_id: Uuid, session_id: Uuid) -> UploadResult<UploadSession> {
        match self.sessions.get(session_id).await? {
            Some(session) if session.owner_id == owner_id => Ok(session),
            _ => Err(UploadError::SessionNotFound(session_id)),
        }
    }

    /// Explain why a guarded write on `session_id` matched no row.
    async fn rejection(&self, session_id: Uuid) -> UploadError {
        match self.sessions.get(session_id).await {
            Err(err) => err,
            Ok(None) => UploadError::SessionNotFound(session_id),
            Ok(Some(session)) => match session.status {
                SessionStatus::Completing => UploadError::AlreadyCompleting(session_id),
                SessionStatus::Aborted => UploadError::SessionAborted(session_id),
                SessionStatus::Completed => UploadError::SessionNotFound(session_id),
                SessionStatus::Pending | SessionStatus::Uploading => {
                    if session.is_expired(Utc::now()) {
                        UploadError::SessionExpired(session_id)
                    } else {
                        UploadError::SessionNotFound(session_id)
                    }
                }
            },
        }
    }

    /// Status gate shared by chunk acceptance and completion.
    fn ensure_active(session: &UploadSession, now: DateTime<Utc>) -> UploadResult<()> {
        match session.status {
            SessionStatus::Completing => Err(UploadError::AlreadyCompleting(session.session_id)),
            SessionStatus::Completed => Err(UploadError::SessionNotFound(session.session_id)),
            SessionStatus::Aborted => Err(UploadError::SessionAborted(session.session_id)),
            SessionStatus::Pending | SessionStatus::Uploading if session.is_expired(now) => {
                Err(UploadError::SessionExpired(session.session_id))
            }
            SessionStatus::Pending | SessionStatus::Uploading => Ok(()),
        }
    }

    /// Provider abort that only logs. `NoSuchUpload` counts as done.
    ///
    /// Callers only abort sessions no file record points at, so an object the
    /// upload may already have been assembled into is deleted as well.
    async fn abort_quietly(&self, session_id: Uuid, object_key: &str, upload_id: &str) -> bool {
        match self
            .provider("abort", self.gateway.abort(object_key, upload_id))
            .await
        {
            Ok(()) => true,
            Err(GatewayError::NoSuchUpload(_)) => {
                self.delete_object_quietly(object_key).await;
                true
            }
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    object_key = %object_key,
                    backend = self.gateway.backend_name(),
                    error = %err,
                    "provider abort failed; relying on provider expiry"
                );
                false
            }
        }
    }

    async fn delete_object_quietly(&self, object_key: &str) {
        if let Err(err) = self
            .provider("delete", self.gateway.delete(object_key))
            .await
        {
            warn!(object_key = %object_key, error = %err, "failed to delete orphaned object");
        }
    }

    async fn forget(&self, session_id: Uuid) {
        if let Err(err) = self.sessions.delete(session_id).await {
            warn!(session_id = %session_id, error = %err, "failed to delete session; reaper will retry");
        }
    }

    /// Open a session, or short-circuit to the existing file.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn create(&self, request: CreateSessionRequest) -> UploadResult<CreateOutcome> {
        let name = validate_name(&request.file_name)?;
        let content_hash = normalize_sha256(&request.content_hash).ok_or_else(|| {
            UploadError::Validation("contentHash must be a hex SHA-256 digest".into())
        })?;
        if request.chunk_size > self.settings.max_chunk_size {
            return Err(UploadError::Validation(format!(
                "chunkSize {} exceeds the maximum of {}",
                request.chunk_size, self.settings.max_chunk_size
            )));
        }
        let plan = ChunkPlan::new(request.total_size, request.chunk_size).ok_or_else(|| {
            UploadError::Validation("totalSize and chunkSize must be greater than zero".into())
        })?;
        if plan.chunk_count > self.settings.max_chunks {
            return Err(UploadError::Validation(format!(
                "{} chunks exceed the limit of {}",
                plan.chunk_count, self.settings.max_chunks
            )));
        }
        let min_part = self.gateway.min_part_size();
        if plan.chunk_count > 1 && plan.chunk_size < min_part {
            return Err(UploadError::Validation(format!(
                "chunkSize {} is below the {} backend's minimum part size of {min_part}",
                plan.chunk_size,
                self.gateway.backend_name()
            )));
        }
        to_i64(plan.total_size)?;

        let owner_id = request.owner_id;
        if let Some(existing) = self.dedup.check_existing(owner_id, &content_hash).await? {
            info!(file_id = %existing.id, "instant upload: content already stored");
            return Ok(CreateOutcome::Instant(existing));
        }

        if !self.quota.reserve_if_fits(owner_id, plan.total_size).await? {
            return Err(UploadError::QuotaExceeded {
                requested: plan.total_size,
                available: self.quota.available_space(owner_id).await?,
            });
        }

        let now = Utc::now();
        if let Some(open) = self.sessions.find_open(owner_id, &content_hash).await? {
            if open.status.accepts_chunks() && open.is_expired(now) {
                debug!(session_id = %open.session_id, "replacing expired session");
                self.abandon(open).await?;
            } else {
                return Err(UploadError::DuplicateSession {
                    session_id: open.session_id,
                });
            }
        }

        let session_id = Uuid::new_v4();
        let object_key = object_key_for(owner_id, request.parent_id, session_id, &name);
        let upload_id = self
            .provider("initiate", self.gateway.initiate(&object_key))
            .await?;

        let session = UploadSession {
            session_id,
            owner_id,
            target_name: name,
            parent_id: request.parent_id,
            total_size: plan.total_size,
            content_hash,
            chunk_size: plan.chunk_size,
            chunk_count: plan.chunk_count,
            object_key,
            provider_upload_id: upload_id,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: self.expiry_from(now)?,
            received_parts: BTreeMap::new(),
        };

        if let Err(err) = self.sessions.insert(&session).await {
            self.abort_quietly(session_id, &session.object_key, &session.provider_upload_id)
                .await;
            return Err(err);
        }

        info!(
            session_id = %session_id,
            object_key = %session.object_key,
            chunk_count = plan.chunk_count,
            "upload session created"
        );
        Ok(CreateOutcome::Created(SessionTicket {
            session_id,
            chunk_size: plan.chunk_size,
            chunk_count: plan.chunk_count,
            expires_at: session.expires_at,
        }))
    }

    /// Verify and store one chunk.
    #[instrument(skip(self, data, declared_hash), fields(size = data.len()))]
    pub async fn accept_chunk(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
        index: u32,
        data: Bytes,
        declared_hash: &str,
    ) -> UploadResult<ChunkReceipt> {
        let session = self.load_owned(owner_id, session_id).await?;
        let now = Utc::now();
        Self::ensure_active(&session, now)?;

        let expected_len = session.plan().chunk_len(index).ok_or_else(|| {
            UploadError::Validation(format!(
                "chunk index {index} is outside 0..{}",
                session.chunk_count
            ))
        })?;
        if data.len() as u64 != expected_len {
            return Err(UploadError::Validation(format!(
                "chunk {index} must be {expected_len} bytes, got {}",
                data.len()
            )));
        }

        let declared = normalize_sha256(declared_hash).ok_or_else(|| {
            UploadError::Validation("chunkHash must be a hex SHA-256 digest".into())
        })?;
        let actual = sha256_hex(&data);
        if actual != declared {
            return Err(UploadError::ChunkHashMismatch {
                index,
                declared,
                actual,
            });
        }

        let expires_at = self.expiry_from(now)?;

        if let Some(existing) = session.received_parts.get(&index)
            && existing.chunk_hash == actual
        {
            if !self.sessions.touch(session_id, now, expires_at).await? {
                return Err(self.rejection(session_id).await);
            }
            debug!(chunk_index = index, "chunk already recorded");
            return Ok(ChunkReceipt {
                index,
                part_tag: existing.part_tag.clone(),
                duplicate: true,
            });
        }

        let uploaded = self
            .provider(
                "upload_part",
                self.gateway.upload_part(
                    &session.object_key,
                    &session.provider_upload_id,
                    index + 1,
                    data,
                ),
            )
            .await;
        let part_tag = match uploaded {
            Ok(tag) => tag,
            // The provider dropped the upload; the session can never finish.
            Err(GatewayError::NoSuchUpload(_)) => {
                warn!(session_id = %session_id, "provider lost the multipart upload");
                return Err(match self.abandon(session).await {
                    Ok(_) => UploadError::SessionAborted(session_id),
                    Err(err) => err,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let part = ReceivedPart {
            part_tag: part_tag.clone(),
            chunk_hash: actual,
            size_bytes: expected_len,
            received_at: now,
        };
        if !self
            .sessions
            .record_part(session_id, index, &part, now, expires_at)
            .await?
        {
            return Err(self.rejection(session_id).await);
        }

        debug!(chunk_index = index, part_tag = %part_tag, "chunk accepted");
        Ok(ChunkReceipt {
            index,
            part_tag,
            duplicate: false,
        })
    }

    pub async fn completion_status(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> UploadResult<UploadProgress> {
        Ok(self.load_owned(owner_id, session_id).await?.progress())
    }

    /// Finalize the upload into a file record.
    ///
    /// Failures before the provider assembles the object reopen the session.
    /// Once the object exists the session stays `Completing` until a record
    /// points at it or the object is deleted.
    #[instrument(skip(self))]
    pub async fn complete(&self, owner_id: Uuid, session_id: Uuid) -> UploadResult<FileRecord> {
        let session = self.load_owned(owner_id, session_id).await?;
        let now = Utc::now();
        Self::ensure_active(&session, now)?;

        if !session.is_fully_received() {
            return Err(UploadError::IncompleteUpload {
                missing: session.missing_indices(),
            });
        }

        if !self
            .sessions
            .begin_completion(session_id, now, self.completion_lease(now)?)
            .await?
        {
            return Err(self.rejection(session_id).await);
        }

        if let Err(err) = self.assemble(&session).await {
            return Err(self.assembly_failed(&session, err).await);
        }

        match self.commit_assembled(&session).await {
            Ok(record) => {
                self.forget(session_id).await;
                info!(
                    session_id = %session_id,
                    file_id = %record.id,
                    size = record.size_bytes,
                    "upload completed"
                );
                Ok(record)
            }
            Err(err) => Err(self.commit_failed(&session, err).await),
        }
    }

    /// Deadline for a `Completing` session before the reaper may take it over.
    fn completion_lease(&self, now: DateTime<Utc>) -> UploadResult<DateTime<Utc>> {
        // list_parts, complete and exists, plus the local commit.
        let lease = self
            .settings
            .provider_timeout
            .saturating_mul(4)
            .max(MIN_COMPLETION_LEASE);
        chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| UploadError::Configuration("provider timeout is out of range".into()))
    }

    /// Get the finished object stored at the provider.
    ///
    /// An error here means no object was assembled by this call.
    async fn assemble(&self, session: &UploadSession) -> UploadResult<()> {
        let ledger = self.quota.ensure_ledger(session.owner_id).await?;
        if ledger.available() < session.total_size {
            return Err(UploadError::QuotaExceeded {
                requested: session.total_size,
                available: ledger.available(),
            });
        }

        match self.reconcile_parts(session).await {
            Err(UploadError::Provider(GatewayError::NoSuchUpload(_))) => {
                return self.adopt_assembled(session).await;
            }
            other => other?,
        }

        let completed = self
            .provider(
                "complete",
                self.gateway.complete(
                    &session.object_key,
                    &session.provider_upload_id,
                    &session.ordered_parts(),
                ),
            )
            .await;
        match completed {
            Ok(url) => {
                debug!(object_key = %session.object_key, url = %url, "provider assembled object");
                Ok(())
            }
            Err(GatewayError::NoSuchUpload(_)) => self.adopt_assembled(session).await,
            Err(err) => Err(err.into()),
        }
    }

    /// The provider no longer knows the multipart upload. Either an earlier
    /// attempt assembled it, or it is gone for good.
    async fn adopt_assembled(&self, session: &UploadSession) -> UploadResult<()> {
        if self
            .provider("exists", self.gateway.exists(&session.object_key))
            .await?
        {
            debug!(object_key = %session.object_key, "object already assembled");
            Ok(())
        } else {
            warn!(
                session_id = %session.session_id,
                "provider lost the multipart upload"
            );
            Err(UploadError::SessionAborted(session.session_id))
        }
    }

    /// Nothing was assembled: terminal errors discard the session, anything
    /// else reopens it for another attempt.
    async fn assembly_failed(&self, session: &UploadSession, err: UploadError) -> UploadError {
        let session_id = session.session_id;
        match err {
            UploadError::QuotaExceeded { .. } | UploadError::SessionAborted(_) => {
                warn!(session_id = %session_id, error = %err, "completion is impossible; discarding session");
                self.discard_completing(session).await;
            }
            _ => {
                warn!(session_id = %session_id, error = %err, "completion failed; session reopened");
                let now = Utc::now();
                let reopened = match self.expiry_from(now) {
                    Ok(expires_at) => self.sessions.reopen(session_id, now, expires_at).await,
                    Err(expiry_err) => Err(expiry_err),
                };
                if let Err(reopen_err) = reopened {
                    warn!(session_id = %session_id, error = %reopen_err, "failed to reopen session");
                }
            }
        }
        err
    }

    /// The object exists but its record did not commit.
    async fn commit_failed(&self, session: &UploadSession, err: UploadError) -> UploadError {
        let session_id = session.session_id;
        match &err {
            UploadError::QuotaExceeded { .. } => {
                warn!(session_id = %session_id, error = %err, "quota exhausted at commit; discarding object");
                self.delete_object_quietly(&session.object_key).await;
                self.discard_completing(session).await;
            }
            UploadError::SessionNotFound(_) => {
                warn!(session_id = %session_id, "session vanished before commit; discarding object");
                self.delete_object_quietly(&session.object_key).await;
            }
            _ => {
                warn!(
                    session_id = %session_id,
                    object_key = %session.object_key,
                    error = %err,
                    "assembled object awaits its record; reaper will retry"
                );
            }
        }
        err
    }

    /// `Completing -> Aborted`, release the provider upload and forget the session.
    async fn discard_completing(&self, session: &UploadSession) -> bool {
        let session_id = session.session_id;
        if let Err(err) = self
            .sessions
            .transition(
                session_id,
                &[SessionStatus::Completing],
                SessionStatus::Aborted,
                Utc::now(),
            )
            .await
        {
            warn!(session_id = %session_id, error = %err, "failed to mark session aborted");
        }
        let aborted = self
            .abort_quietly(session_id, &session.object_key, &session.provider_upload_id)
            .await;
        self.forget(session_id).await;
        aborted
    }

    /// Quota delta, file record and `Completed` status in one transaction.
    async fn commit_assembled(&self, session: &UploadSession) -> UploadResult<FileRecord> {
        let size = to_i64(session.total_size)?;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        // The bounded quota update comes first so the transaction takes the write lock immediately.
        self.quota
            .apply_delta(&mut tx, session.owner_id, size, now)
            .await?;

        let record = self
            .writer
            .commit(
                &mut tx,
                NewFileRecord {
                    owner_id: session.owner_id,
                    name: session.target_name.clone(),
                    parent_id: session.parent_id,
                    object_key: session.object_key.clone(),
                    content_hash: session.content_hash.clone(),
                    size: session.total_size,
                },
                now,
            )
            .await?;

        if !SessionStore::transition_on(
            &mut tx,
            session.session_id,
            &[SessionStatus::Completing],
            SessionStatus::Completed,
            now,
        )
        .await?
        {
            return Err(UploadError::SessionNotFound(session.session_id));
        }

        tx.commit().await?;
        Ok(record)
    }

    /// Check the provider still holds every recorded part with the recorded tag.
    /// Parts it has lost are dropped so the client can resend them.
    async fn reconcile_parts(&self, session: &UploadSession) -> UploadResult<()> {
        let listed = self
            .provider(
                "list_parts",
                self.gateway
                    .list_parts(&session.object_key, &session.provider_upload_id),
            )
            .await?;
        let held: BTreeMap<u32, String> = listed
            .into_iter()
            .map(|part| (part.part_number, part.tag))
            .collect();

        let stale: Vec<u32> = session
            .received_parts
            .iter()
            .filter(|(index, part)| held.get(&(**index + 1)) != Some(&part.part_tag))
            .map(|(index, _)| *index)
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        warn!(
            session_id = %session.session_id,
            stale = ?stale,
            "provider is missing recorded parts"
        );
        self.sessions
            .remove_parts(session.session_id, &stale)
            .await?;
        Err(UploadError::IncompleteUpload { missing: stale })
    }

    /// Cancel an upload. Unknown, finished and already-cancelled sessions are a no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, owner_id: Uuid, session_id: Uuid) -> UploadResult<()> {
        let session = match self.sessions.get(session_id).await? {
            Some(session) if session.owner_id == owner_id => session,
            _ => return Ok(()),
        };

        if session.status.is_terminal() {
            return Ok(());
        }
        if session.status == SessionStatus::Completing {
            return Err(UploadError::AlreadyCompleting(session_id));
        }

        self.abandon(session).await?;
        info!(session_id = %session_id, "upload cancelled");
        Ok(())
    }

    /// Move an open session to `Aborted`, release the provider upload and forget it.
    async fn abandon(&self, session: UploadSession) -> UploadResult<bool> {
        let session_id = session.session_id;
        if !self
            .sessions
            .transition(
                session_id,
                &[SessionStatus::Pending, SessionStatus::Uploading],
                SessionStatus::Aborted,
                Utc::now(),
            )
            .await?
        {
            return match self.rejection(session_id).await {
                UploadError::SessionAborted(_) | UploadError::SessionNotFound(_) => Ok(true),
                err => Err(err),
            };
        }

        let aborted = self
            .abort_quietly(session_id, &session.object_key, &session.provider_upload_id)
            .await;
        self.sessions.delete(session_id).await?;
        Ok(aborted)
    }

    /// Clean up every session whose expiry lies before `now`.
    ///
    /// Open sessions are aborted. Completions that stopped part way are
    /// driven to the end, or discarded together with their object when they
    /// can never finish.
    #[instrument(skip(self))]
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> UploadResult<ReapReport> {
        let expired = self
            .sessions
            .expired(now, self.settings.reap_batch)
            .await?;
        let mut report = ReapReport {
            examined: expired.len(),
            ..ReapReport::default()
        };

        for session in expired {
            let session_id = session.session_id;
            let outcome = match session.status {
                // Committed but not yet forgotten.
                SessionStatus::Completed => self
                    .sessions
                    .delete(session_id)
                    .await
                    .map(|_| Reaped::Removed { aborted: true }),
                SessionStatus::Pending | SessionStatus::Uploading => self
                    .abandon(session)
                    .await
                    .map(|aborted| Reaped::Removed { aborted }),
                SessionStatus::Aborted => {
                    let aborted = self
                        .abort_quietly(session_id, &session.object_key, &session.provider_upload_id)
                        .await;
                    self.sessions
                        .delete(session_id)
                        .await
                        .map(|_| Reaped::Removed { aborted })
                }
                SessionStatus::Completing => self.recover_completion(session, now).await,
            };

            match outcome {
                Ok(Reaped::Removed { aborted }) => {
                    report.reaped += 1;
                    if !aborted {
                        report.abort_failures += 1;
                    }
                }
                Ok(Reaped::Recovered) => report.recovered += 1,
                Ok(Reaped::Deferred) | Err(UploadError::AlreadyCompleting(_)) => {}
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "failed to reap session");
                }
            }
        }

        if report.reaped > 0 || report.recovered > 0 {
            info!(
                examined = report.examined,
                reaped = report.reaped,
                recovered = report.recovered,
                abort_failures = report.abort_failures,
                "expired upload sessions reaped"
            );
        }
        Ok(report)
    }

    /// A `Completing` session whose lease ran out: the request driving it
    /// stopped somewhere between the provider and the local commit.
    async fn recover_completion(
        &self,
        session: UploadSession,
        now: DateTime<Utc>,
    ) -> UploadResult<Reaped> {
        let session_id = session.session_id;
        if self
            .dedup
            .live_record_for_key(session.owner_id, &session.object_key)
            .await?
            .is_some()
        {
            self.sessions.delete(session_id).await?;
            return Ok(Reaped::Removed { aborted: true });
        }

        if !self
            .sessions
            .reclaim_completion(session_id, now, self.completion_lease(now)?)
            .await?
        {
            return Ok(Reaped::Deferred);
        }

        if let Err(err) = self.assemble(&session).await {
            if Self::worth_retrying(&err) {
                warn!(session_id = %session_id, error = %err, "completion recovery deferred");
                return Ok(Reaped::Deferred);
            }
            warn!(session_id = %session_id, error = %err, "interrupted completion cannot finish");
            let aborted = self.discard_completing(&session).await;
            return Ok(Reaped::Removed { aborted });
        }

        match self.commit_assembled(&session).await {
            Ok(record) => {
                self.forget(session_id).await;
                info!(
                    session_id = %session_id,
                    file_id = %record.id,
                    "interrupted completion recovered"
                );
                Ok(Reaped::Recovered)
            }
            Err(err) => match self.commit_failed(&session, err).await {
                UploadError::QuotaExceeded { .. } | UploadError::SessionNotFound(_) => {
                    Ok(Reaped::Removed { aborted: true })
                }
                _ => Ok(Reaped::Deferred),
            },
        }
    }

    /// Errors after which a later reaper pass may still finish the upload.
    fn worth_retrying(err: &UploadError) -> bool {
        matches!(err, UploadError::Database(_)) || err.is_retryable()
    }
}

/// What a reaper pass did with one session.
enum Reaped {
    Removed { aborted: bool },
    Recovered,
    /// Left for a later pass.
    Deferred,
}

pub(crate) fn validate_name(name: &str) -> UploadResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(UploadError::Validation("fileName must not be empty".into()));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(UploadError::Validation(format!(
            "fileName exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if trimmed
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(UploadError::Validation(
            "fileName must not contain path separators or control characters".into(),
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_checked() {
        assert_eq!(validate_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_name("   ").is_err());
        assert!(validate_name("a/b.txt").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn default_settings() {
        let settings = UploadSettings::default();
        assert_eq!(settings.session_ttl, Duration::from_secs(86_400));
        assert_eq!(settings.max_chunks, 10_000);
    }
}
