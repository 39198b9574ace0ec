//! Local filesystem object gateway.
//!
//! Multipart uploads are staged under `staging/{upload_id}/` with one file per
//! part. Completion concatenates the parts into a temporary file beside the
//! final location, fsyncs it and renames it into place under
//! `objects/{shard}/{shard}/{key}`.

use super::{ByteStream, CompletedPart, GatewayError, GatewayResult, ObjectGateway, PartInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGING_DIR: &str = "staging";
const OBJECTS_DIR: &str = "objects";
const KEY_MARKER: &str = "key";
const PART_SUFFIX: &str = ".part";

/// Read buffer used when hashing or concatenating parts (64 KiB).
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Multipart-capable object gateway backed by a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemGateway {
    root: PathBuf,
}

impl FilesystemGateway {
    pub async fn new(root: impl AsRef<Path>) -> GatewayResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        Ok(Self { root })
    }

    /// Rejects empty, oversized, absolute and traversing keys.
    fn ensure_key_safe(key: &str) -> GatewayResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        if key.starts_with('/') || key.contains("..") || key.ends_with('/') {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Upload ids are generated here, so anything else is unknown.
    fn ensure_upload_id_safe(upload_id: &str) -> GatewayResult<()> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GatewayError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories derived from MD5(key).
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn objects_root(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_path(&self, upload_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload_id)
    }

    fn part_path(staging: &Path, part_number: u32) -> PathBuf {
        staging.join(format!("{part_number:05}{PART_SUFFIX}"))
    }

    fn object_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    /// Open an existing upload and check it was initiated for `key`.
    async fn open_upload(&self, key: &str, upload_id: &str) -> GatewayResult<PathBuf> {
        Self::ensure_upload_id_safe(upload_id)?;
        let staging = self.staging_path(upload_id);
        let recorded = match fs::read_to_string(staging.join(KEY_MARKER)).await {
            Ok(recorded) => recorded,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::NoSuchUpload(upload_id.to_string()));
            }
            Err(err) => return Err(GatewayError::Io(err)),
        };
        if recorded != key {
            return Err(GatewayError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(staging)
    }

    /// Write `data` to `path` via a fsynced temporary file and a rename.
    async fn write_atomically(path: &Path, data: &[u8]) -> GatewayResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }
        Ok(())
    }

    /// MD5 hex digest of a file, read incrementally.
    async fn file_md5(path: &Path) -> io::Result<(String, u64)> {
        let mut file = File::open(path).await?;
        let mut digest = md5::Context::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            size += n as u64;
        }
        Ok((format!("{:x}", digest.compute()), size))
    }

    /// Append every part to `out`, checking each against its recorded tag.
    async fn concatenate_parts(
        staging: &Path,
        parts: &[CompletedPart],
        out: &mut File,
    ) -> GatewayResult<()> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        for part in parts {
            let path = Self::part_path(staging, part.part_number);
            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(GatewayError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".into(),
                    });
                }
                Err(err) => return Err(GatewayError::Io(err)),
            };

            let mut digest = md5::Context::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                out.write_all(&buf[..n]).await?;
            }

            let actual = format!("{:x}", digest.compute());
            if actual != part.tag {
                return Err(GatewayError::InvalidPart {
                    part_number: part.part_number,
                    reason: format!("tag mismatch: expected {}, stored {}", part.tag, actual),
                });
            }
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectGateway for FilesystemGateway {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn initiate(&self, key: &str) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let staging = self.staging_path(&upload_id);
        fs::create_dir_all(&staging).await?;
        Self::write_atomically(&staging.join(KEY_MARKER), key.as_bytes()).await?;
        debug!(upload_id = %upload_id, "staged multipart upload");
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        if part_number == 0 {
            return Err(GatewayError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let staging = self.open_upload(key, upload_id).await?;
        Self::write_atomically(&Self::part_path(&staging, part_number), &data).await?;
        Ok(format!("{:x}", md5::compute(&data)))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_parts(&self, key: &str, upload_id: &str) -> GatewayResult<Vec<PartInfo>> {
        Self::ensure_key_safe(key)?;
        let staging = self.open_upload(key, upload_id).await?;

        let mut parts = Vec::new();
        let mut entries = fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|name| name.strip_suffix(PART_SUFFIX))
                .and_then(|stem| stem.parse::<u32>().ok())
            else {
                continue;
            };
            let (tag, size) = Self::file_md5(&entry.path()).await?;
            parts.push(PartInfo {
                part_number: number,
                tag,
                size,
            });
        }
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        let final_path = self.object_path(key);

        let staging = match self.open_upload(key, upload_id).await {
            Ok(staging) => staging,
            // A retried completion finds the staging area already consumed.
            Err(GatewayError::NoSuchUpload(id)) => {
                if fs::try_exists(&final_path).await? {
                    debug!(path = %final_path.display(), "multipart upload already assembled");
                    return Ok(Self::object_url(&final_path));
                }
                return Err(GatewayError::NoSuchUpload(id));
            }
            Err(err) => return Err(err),
        };

        if parts.is_empty() {
            return Err(GatewayError::InvalidPart {
                part_number: 0,
                reason: "at least one part is required".into(),
            });
        }
        if let Some(pair) = parts
            .windows(2)
            .find(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(GatewayError::InvalidPart {
                part_number: pair[1].part_number,
                reason: "parts must be in ascending order".into(),
            });
        }

        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let assembled = async {
            let mut out = File::create(&tmp_path).await?;
            Self::concatenate_parts(&staging, parts, &mut out).await?;
            out.flush().await?;
            out.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await?;
            Ok::<(), GatewayError>(())
        }
        .await;

        if let Err(err) = assembled {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!("failed to clear staging {}: {}", staging.display(), err);
        }

        Ok(Self::object_url(&final_path))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        Self::ensure_key_safe(key)?;
        let staging = self.open_upload(key, upload_id).await?;
        match fs::remove_dir_all(&staging).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GatewayError::Io(err)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        Self::write_atomically(&path, &data).await?;
        Ok(Self::object_url(&path))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> GatewayResult<ByteStream> {
        Self::ensure_key_safe(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::NotFound(key.to_string())
            } else {
                GatewayError::Io(err)
            }
        })?;
        Ok(Box::pin(ReaderStream::with_capacity(file, COPY_BUFFER_SIZE)))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> GatewayResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(GatewayError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            Self::prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> GatewayResult<bool> {
        Self::ensure_key_safe(key)?;
        Ok(fs::try_exists(self.object_path(key)).await?)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> GatewayResult<()> {
        for dir in [STAGING_DIR, OBJECTS_DIR] {
            let metadata = fs::metadata(self.root.join(dir)).await?;
            if !metadata.is_dir() {
                return Err(GatewayError::Io(io::Error::new(
                    ErrorKind::NotADirectory,
                    format!("{dir} is not a directory under {}", self.root.display()),
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn read_all(gateway: &FilesystemGateway, key: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = gateway.get(key).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();
        let key = "files/owner/report.pdf";

        let upload_id = gateway.initiate(key).await.unwrap();
        // Out-of-order arrival.
        let tag2 = gateway
            .upload_part(key, &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let tag1 = gateway
            .upload_part(key, &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(tag1, format!("{:x}", md5::compute(b"hello ")));

        let listed = gateway.list_parts(key, &upload_id).await.unwrap();
        assert_eq!(
            listed,
            vec![
                PartInfo { part_number: 1, tag: tag1.clone(), size: 6 },
                PartInfo { part_number: 2, tag: tag2.clone(), size: 5 },
            ]
        );

        let parts = vec![
            CompletedPart { part_number: 1, tag: tag1 },
            CompletedPart { part_number: 2, tag: tag2 },
        ];
        let url = gateway.complete(key, &upload_id, &parts).await.unwrap();
        assert!(url.starts_with("file://"));
        assert_eq!(read_all(&gateway, key).await, b"hello world");

        // Retried completion after staging is gone still succeeds.
        let again = gateway.complete(key, &upload_id, &parts).await.unwrap();
        assert_eq!(again, url);
    }

    #[tokio::test]
    async fn complete_rejects_mismatched_tag() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();
        let key = "files/owner/a.bin";

        let upload_id = gateway.initiate(key).await.unwrap();
        gateway
            .upload_part(key, &upload_id, 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let err = gateway
            .complete(
                key,
                &upload_id,
                &[CompletedPart { part_number: 1, tag: "deadbeef".into() }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPart { part_number: 1, .. }));
        assert!(matches!(gateway.get(key).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn abort_discards_staged_parts() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();
        let key = "files/owner/b.bin";

        let upload_id = gateway.initiate(key).await.unwrap();
        gateway
            .upload_part(key, &upload_id, 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        gateway.abort(key, &upload_id).await.unwrap();

        assert!(matches!(
            gateway.list_parts(key, &upload_id).await,
            Err(GatewayError::NoSuchUpload(_))
        ));
        assert!(matches!(
            gateway
                .upload_part(key, &upload_id, 2, Bytes::from_static(b"x"))
                .await,
            Err(GatewayError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn upload_id_is_bound_to_its_key() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();

        let upload_id = gateway.initiate("files/owner/c.bin").await.unwrap();
        let err = gateway
            .upload_part("files/owner/other.bin", &upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoSuchUpload(_)));
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();
        let key = "files/owner/notes.txt";

        assert!(!gateway.exists(key).await.unwrap());
        gateway.put(key, Bytes::from_static(b"notes")).await.unwrap();
        assert!(gateway.exists(key).await.unwrap());
        assert_eq!(read_all(&gateway, key).await, b"notes");

        gateway.delete(key).await.unwrap();
        assert!(!gateway.exists(key).await.unwrap());
        assert!(matches!(gateway.get(key).await, Err(GatewayError::NotFound(_))));
        // Deleting again is harmless.
        gateway.delete(key).await.unwrap();
        gateway.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn unsafe_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FilesystemGateway::new(dir.path()).await.unwrap();

        for key in ["", "/abs", "a/../b", "dir/", "tab\tkey"] {
            assert!(
                matches!(gateway.initiate(key).await, Err(GatewayError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
        assert!(matches!(
            gateway.list_parts("files/a", "../escape").await,
            Err(GatewayError::NoSuchUpload(_))
        ));
    }
}
