//! S3-compatible object gateway using the AWS SDK.

use super::{ByteStream, CompletedPart, GatewayError, GatewayResult, ObjectGateway, PartInfo};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{Client, error::ProvideErrorMetadata, error::SdkError};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};

/// S3 caps a multipart upload at this many parts.
const MAX_PARTS: u32 = 10_000;

/// S3 rejects non-final parts below 5 MiB with `EntityTooSmall`.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

fn map_s3_error<E>(err: SdkError<E>) -> GatewayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    GatewayError::S3(Box::new(err))
}

/// Map `NoSuchUpload` / 404 service errors, everything else is an S3 error.
fn map_upload_error<E>(err: SdkError<E>, upload_id: &str) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if err.code() == Some("NoSuchUpload") {
        return GatewayError::NoSuchUpload(upload_id.to_string());
    }
    map_s3_error(err)
}

fn map_object_error<E>(err: SdkError<E>, key: &str) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err
        && service_err.raw().status().as_u16() == 404
    {
        return GatewayError::NotFound(key.to_string());
    }
    if err.code() == Some("NoSuchKey") {
        return GatewayError::NotFound(key.to_string());
    }
    map_s3_error(err)
}

/// Bare `host:port` endpoints are treated as plain HTTP.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

fn prefixed_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{key}"),
        None => key.to_string(),
    }
}

/// ETags come back quoted, part tags are stored bare.
fn bare_tag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Multipart-capable gateway for AWS S3, MinIO and other S3-compatible stores.
pub struct S3Gateway {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Base URL used when reporting object locations.
    public_base: String,
    force_path_style: bool,
}

impl std::fmt::Debug for S3Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Gateway")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("public_base", &self.public_base)
            .finish_non_exhaustive()
    }
}

impl S3Gateway {
    /// Build a client for `bucket`.
    ///
    /// Explicit credentials win; otherwise the ambient AWS credential chain
    /// (environment, profile, instance metadata) is used. `force_path_style`
    /// is needed for MinIO and most self-hosted S3 implementations.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> GatewayResult<Self> {
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(GatewayError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "cloud-drive");
            builder = builder.credentials_provider(credentials);
        } else {
            let chain = aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(aws_config::Region::new(region.clone()))
                .build()
                .await;
            builder = builder.credentials_provider(chain);
        }

        let endpoint = endpoint.as_deref().map(normalize_endpoint);
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let public_base = match &endpoint {
            Some(url) => url.clone(),
            None => format!("https://s3.{region}.amazonaws.com"),
        };

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            public_base,
            force_path_style,
        })
    }

    fn full_key(&self, key: &str) -> String {
        prefixed_key(self.prefix.as_deref(), key)
    }

    fn object_url(&self, full_key: &str) -> String {
        if self.force_path_style || !self.public_base.starts_with("https://s3.") {
            format!("{}/{}/{}", self.public_base, self.bucket, full_key)
        } else {
            let host = self.public_base.trim_start_matches("https://");
            format!("https://{}.{}/{}", self.bucket, host, full_key)
        }
    }

    fn part_number(part_number: u32) -> GatewayResult<i32> {
        if part_number == 0 || part_number > MAX_PARTS {
            return Err(GatewayError::InvalidPart {
                part_number,
                reason: format!("part numbers must be within 1..={MAX_PARTS}"),
            });
        }
        Ok(part_number as i32)
    }
}

#[async_trait]
impl ObjectGateway for S3Gateway {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn initiate(&self, key: &str) -> GatewayResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> GatewayResult<String> {
        let number = Self::part_number(part_number)?;
        let content_md5 = BASE64.encode(md5::compute(&data).0);

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .part_number(number)
            .content_md5(content_md5)
            .body(data.into())
            .send()
            .await
            .map_err(|err| map_upload_error(err, upload_id))?;

        output
            .e_tag()
            .map(bare_tag)
            .ok_or_else(|| GatewayError::InvalidPart {
                part_number,
                reason: "S3 did not return an ETag".into(),
            })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_parts(&self, key: &str, upload_id: &str) -> GatewayResult<Vec<PartInfo>> {
        let full_key = self.full_key(key);
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(upload_id);
            if let Some(marker) = marker.take() {
                request = request.part_number_marker(marker);
            }

            let output = request
                .send()
                .await
                .map_err(|err| map_upload_error(err, upload_id))?;

            for part in output.parts() {
                let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(PartInfo {
                    part_number: number.max(0) as u32,
                    tag: bare_tag(etag),
                    size: part.size().unwrap_or(0).max(0) as u64,
                });
            }

            if output.is_truncated() == Some(true) {
                marker = output.next_part_number_marker().map(str::to_string);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String> {
        let full_key = self.full_key(key);
        let completed = parts
            .iter()
            .map(|part| {
                Ok(aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(Self::part_number(part.part_number)?)
                    .e_tag(format!("\"{}\"", part.tag))
                    .build())
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|err| map_upload_error(err, upload_id))?;

        Ok(self.object_url(&full_key))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| map_upload_error(err, upload_id))?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> GatewayResult<String> {
        let full_key = self.full_key(key);
        let content_md5 = BASE64.encode(md5::compute(&data).0);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_md5(content_md5)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(self.object_url(&full_key))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> GatewayResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|err| map_object_error(err, key))?;

        let stream = ReaderStream::new(output.body.into_async_read()).map_err(|err| {
            warn!(error = %err, "S3 download stream failed");
            err
        });
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|err| map_object_error(err, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> GatewayResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|err| map_object_error(err, key))
        {
            Ok(_) => Ok(true),
            Err(GatewayError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> GatewayResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }
}
