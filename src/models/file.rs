//! Durable file records created when an upload finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A logical file owned by one user, pointing at a stored object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Internal UUID, also the public file id.
    pub id: Uuid,

    /// Owner of the file.
    pub owner_id: Uuid,

    /// Display name, including extension.
    pub name: String,

    /// Size in bytes.
    #[serde(rename = "size")]
    pub size_bytes: i64,

    /// Lowercase hex SHA-256 of the content; the deduplication key.
    pub content_hash: String,

    /// Location of the bytes in object storage.
    pub object_key: String,

    /// Containing folder; `None` means top-level.
    pub parent_id: Option<Uuid>,

    /// Soft-delete flag.
    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }
}

/// Fields supplied by a writer; ids and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub owner_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub object_key: String,
    pub content_hash: String,
    pub size: u64,
}

/// Build the object key for a new file: `files/{owner}/{parent?}/{id}{.ext}`.
///
/// The id is unique per upload, so keys never collide between live records.
pub fn object_key_for(owner_id: Uuid, parent_id: Option<Uuid>, id: Uuid, name: &str) -> String {
    let ext = extension_of(name)
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    match parent_id {
        Some(parent) => format!("files/{owner_id}/{parent}/{id}{ext}"),
        None => format!("files/{owner_id}/{id}{ext}"),
    }
}

/// Lowercased extension when it is short and plain alphanumeric.
fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 16 {
        return None;
    }
    ext.chars()
        .all(|c| c.is_ascii_alphanumeric())
        .then(|| ext.to_ascii_lowercase())
}
