//! Object storage gateway.
//!
//! A narrow interface over a remote object store with multipart semantics:
//! initiate, upload-part, list-parts, complete and abort, plus single-shot
//! put/get/delete for small objects. The upload core only ever talks to
//! `dyn ObjectGateway`; the concrete backend is picked from configuration.

pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, path::PathBuf, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;

pub use filesystem::FilesystemGateway;
pub use s3::S3Gateway;

/// A boxed stream of object bytes for downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("multipart upload `{0}` does not exist")]
    NoSuchUpload(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Failures that may clear up if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_) | Self::S3(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A part as reported by the provider's list-parts call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    pub tag: String,
    pub size: u64,
}

/// A part handed to the provider's complete call, in ascending part order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub tag: String,
}

#[async_trait]
pub trait ObjectGateway: Send + Sync + 'static {
    /// Start a multipart upload for `key` and return the provider upload id.
    async fn initiate(&self, key: &str) -> GatewayResult<String>;

    /// Upload one part. Part numbers are 1-based. Returns the part tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> GatewayResult<String>;

    /// List the parts the provider currently holds for an upload.
    async fn list_parts(&self, key: &str, upload_id: &str) -> GatewayResult<Vec<PartInfo>>;

    /// Assemble the parts into the final object and return its URL.
    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String>;

    /// Discard a multipart upload and any staged parts.
    async fn abort(&self, key: &str, upload_id: &str) -> GatewayResult<()>;

    /// Store a small object in one request and return its URL.
    async fn put(&self, key: &str, data: Bytes) -> GatewayResult<String>;

    /// Stream an object's content.
    async fn get(&self, key: &str) -> GatewayResult<ByteStream>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> GatewayResult<()>;

    /// Whether a finished object is stored at `key`.
    async fn exists(&self, key: &str) -> GatewayResult<bool>;

    /// Static identifier used in logs.
    fn backend_name(&self) -> &'static str;

    /// Smallest size the backend accepts for every part except the last.
    fn min_part_size(&self) -> u64 {
        1
    }

    /// Verify the backend is reachable.
    async fn health_check(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Object storage backend selection.
#[derive(Clone)]
pub enum StorageConfig {
    Filesystem {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    },
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem { root } => f.debug_struct("Filesystem").field("root", root).finish(),
            Self::S3 {
                bucket,
                endpoint,
                region,
                prefix,
                force_path_style,
                ..
            } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("endpoint", endpoint)
                .field("region", region)
                .field("prefix", prefix)
                .field("force_path_style", force_path_style)
                .finish_non_exhaustive(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem { root } => {
                if root.as_os_str().is_empty() {
                    return Err("filesystem storage requires a root directory".into());
                }
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 storage requires a bucket".into());
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(
                        "s3 storage requires both access key id and secret access key when either is set"
                            .into(),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Build the configured gateway.
pub async fn from_config(config: &StorageConfig) -> GatewayResult<Arc<dyn ObjectGateway>> {
    config.validate().map_err(GatewayError::Config)?;

    match config {
        StorageConfig::Filesystem { root } => {
            let gateway = FilesystemGateway::new(root).await?;
            Ok(Arc::new(gateway))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let gateway = S3Gateway::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(gateway))
        }
    }
}
