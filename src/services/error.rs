//! Upload subsystem error taxonomy.

use crate::gateway::GatewayError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Bad sizes, indices or missing fields. Not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The chunk bytes do not hash to the declared value; resend the same index.
    #[error("chunk {index} hash mismatch: declared {declared}, computed {actual}")]
    ChunkHashMismatch {
        index: u32,
        declared: String,
        actual: String,
    },

    /// An open session already exists for this owner and content; resume it.
    #[error("an upload session for this content is already open: {session_id}")]
    DuplicateSession { session_id: Uuid },

    #[error("quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// Object store failure or timeout. Session state is unchanged; only
    /// transient failures are worth repeating.
    #[error("object storage failure: {0}")]
    Provider(#[from] GatewayError),

    /// Another request is finishing this session; poll its status instead.
    #[error("upload session {0} is already completing")]
    AlreadyCompleting(Uuid),

    #[error("upload session {0} not found")]
    SessionNotFound(Uuid),

    #[error("upload session {0} was aborted")]
    SessionAborted(Uuid),

    #[error("upload session {0} has expired")]
    SessionExpired(Uuid),

    #[error("upload is incomplete: {} chunk(s) missing", missing.len())]
    IncompleteUpload { missing: Vec<u32> },

    #[error("file {0} not found")]
    FileNotFound(Uuid),

    /// A quota ledger row could not be found or created.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl UploadError {
    /// Whether the same request may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_transient(),
            Self::ChunkHashMismatch { .. } => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ChunkHashMismatch { .. } => "chunk_hash_mismatch",
            Self::DuplicateSession { .. } => "duplicate_session",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Provider(_) => "provider_error",
            Self::AlreadyCompleting(_) => "already_completing",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionAborted(_) => "session_aborted",
            Self::SessionExpired(_) => "session_expired",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::FileNotFound(_) => "file_not_found",
            Self::Configuration(_) => "configuration_error",
            Self::Database(_) => "database_error",
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// True if an SQLx error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
