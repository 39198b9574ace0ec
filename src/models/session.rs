//! Upload sessions and their chunk plan.

use crate::gateway::CompletedPart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, sqlite::SqliteRow};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// `Pending -> Uploading -> Completing -> Completed`, with `Aborted`
/// reachable from every non-terminal state. `Completing` can fall back to
/// `Uploading` when nothing was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Uploading,
    Completing,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Chunks may only land while the session has not started completing.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown session status `{other}`")),
        }
    }
}

/// How a file of `total_size` bytes splits into chunks of `chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

impl ChunkPlan {
    /// `None` when either size is zero or the count does not fit in `u32`.
    pub fn new(total_size: u64, chunk_size: u64) -> Option<Self> {
        if total_size == 0 || chunk_size == 0 {
            return None;
        }
        let chunk_count = u32::try_from(total_size.div_ceil(chunk_size)).ok()?;
        Some(Self {
            total_size,
            chunk_size,
            chunk_count,
        })
    }

    /// Exact byte length expected for chunk `index`; the last chunk may be short.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        Some((self.total_size - start).min(self.chunk_size))
    }
}

/// A chunk the provider has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPart {
    pub part_tag: String,
    pub chunk_hash: String,
    pub size_bytes: u64,
    pub received_at: DateTime<Utc>,
}

/// Durable record of one chunked upload attempt.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub target_name: String,

    /// Folder the finished file lands in; `None` is the owner's root.
    pub parent_id: Option<Uuid>,

    pub total_size: u64,

    /// Lowercase hex SHA-256 of the whole file.
    pub content_hash: String,

    pub chunk_size: u64,
    pub chunk_count: u32,

    /// Final storage location, fixed at creation.
    pub object_key: String,

    /// Token returned by the provider's initiate call.
    pub provider_upload_id: String,

    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Chunk index (0-based) to acknowledged part. Loaded separately from the row.
    pub received_parts: BTreeMap<u32, ReceivedPart>,
}

impl UploadSession {
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.chunk_count)
            .filter(|index| !self.received_parts.contains_key(index))
            .collect()
    }

    pub fn is_fully_received(&self) -> bool {
        self.received_parts.len() == self.chunk_count as usize
            && self.received_parts.keys().all(|index| *index < self.chunk_count)
    }

    /// Parts in ascending chunk order, numbered the provider's way (1-based).
    pub fn ordered_parts(&self) -> Vec<CompletedPart> {
        self.received_parts
            .iter()
            .map(|(index, part)| CompletedPart {
                part_number: index + 1,
                tag: part.part_tag.clone(),
            })
            .collect()
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            session_id: self.session_id,
            status: self.status,
            received_count: self.received_parts.len() as u32,
            chunk_count: self.chunk_count,
            missing_indices: self.missing_indices(),
            expires_at: self.expires_at,
        }
    }
}

fn non_negative(row: &SqliteRow, column: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

impl<'r> FromRow<'r, SqliteRow> for UploadSession {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<SessionStatus>()
            .map_err(|err| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: err.into(),
            })?;
        let chunk_count = non_negative(row, "chunk_count")?;

        Ok(Self {
            session_id: row.try_get("session_id")?,
            owner_id: row.try_get("owner_id")?,
            target_name: row.try_get("target_name")?,
            parent_id: row.try_get("parent_id")?,
            total_size: non_negative(row, "total_size")?,
            content_hash: row.try_get("content_hash")?,
            chunk_size: non_negative(row, "chunk_size")?,
            chunk_count: u32::try_from(chunk_count).map_err(|err| sqlx::Error::ColumnDecode {
                index: "chunk_count".into(),
                source: Box::new(err),
            })?,
            object_key: row.try_get("object_key")?,
            provider_upload_id: row.try_get("provider_upload_id")?,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
            received_parts: BTreeMap::new(),
        })
    }
}

/// Progress report used by resuming clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub received_count: u32,
    pub chunk_count: u32,
    pub missing_indices: Vec<u32>,
    pub expires_at: DateTime<Utc>,
}
