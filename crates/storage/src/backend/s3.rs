//! S3-compatible storage backend.
//!
//! Covers AWS S3, Backblaze B2, Tigris, MinIO and other S3-compatible
//! services. Credentials are provided explicitly via the configuration file.

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::{BlobMeta, FileInfo, StorageBackend, models::Access, validate_path};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
    types::ObjectCannedAcl,
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible storage backend.
///
/// Stores blobs in a bucket, optionally under a key prefix. All paths are
/// relative to the configured prefix (if any).
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - Provider region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` / `key_secret` - Provider access credentials
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        let credentials = Credentials::new(key_id, key_secret, None, None, "encore-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries with exponential backoff
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services.
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let path_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(join_key(self.prefix.as_deref(), path_str))
    }

    /// Strip the configured prefix from an S3 key to get a relative path.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        validate_path(strip_key(self.prefix.as_deref(), key))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: &DateTime) -> Result<UtcDateTime> {
        UtcDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    fn network<E, R>(err: SdkError<E, R>) -> ErrorKind
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        ErrorKind::Network(DisplayErrorContext(&err).to_string())
    }

    fn content_length(path: &Path, length: Option<i64>) -> Result<u64> {
        u64::try_from(length.unwrap_or_default())
            .or_raise(|| ErrorKind::BackendError(format!("negative content length for {}", path.display())))
    }
}

fn join_key(prefix: Option<&str>, path: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
        None => path.to_string(),
    }
}

fn strip_key<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => {
            let prefix = prefix.trim_end_matches('/');
            key.strip_prefix(prefix).and_then(|s| s.strip_prefix('/')).unwrap_or(key)
        },
        None => key,
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let key_prefix = match prefix.map(|p| self.full_key(p)).transpose() {
            // Component-based matching, same as the filesystem backend.
            Ok(pfx) => pfx.map(|p| format!("{p}/")).or_else(|| self.prefix.as_ref().map(|p| format!("{}/", p.trim_end_matches('/')))),
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        Box::pin(stream! {
            let mut continuation: Option<String> = None;
            loop {
                let _permit = match self.acquire_permit().await {
                    Ok(permit) => permit,
                    Err(e) => { yield Err(e); break; },
                };
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .set_prefix(key_prefix.clone())
                    .set_continuation_token(continuation.take())
                    .send()
                    .await;
                let output = match response {
                    Ok(output) => output,
                    Err(err) => { yield Err(exn::Exn::from(Self::network(err))); break; },
                };
                for object in output.contents() {
                    let Some(key) = object.key() else { continue };
                    let item = self.relative_path(key).and_then(|path| {
                        let size = Self::content_length(&path, object.size())?;
                        let modified = match object.last_modified() {
                            Some(dt) => Self::parse_datetime(dt)?,
                            None => UtcDateTime::UNIX_EPOCH,
                        };
                        Ok(FileInfo::new(path, size, modified))
                    });
                    yield item;
                }
                match output.next_continuation_token() {
                    Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                    _ => break,
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(err) => Err(Self::network(err).into()),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.stream(path).await?;
        let mut buffer = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer).await.map_err(ErrorKind::Io)?;
        Ok(buffer)
    }

    async fn stream(&self, path: &Path) -> Result<BoxAsyncRead> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => exn::bail!(Self::network(err)),
        };
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(Self::network)?;
        Ok(())
    }

    async fn upload(&self, path: &Path, local: &Path, meta: &BlobMeta) -> Result<u64> {
        let key = self.full_key(path)?;
        let size = tokio::fs::metadata(local).await.map_err(ErrorKind::Io)?.len();
        let body = ByteStream::from_path(local)
            .await
            .or_raise(|| ErrorKind::BackendError(format!("cannot open {} for upload", local.display())))?;
        let acl = match meta.access {
            Access::Public => ObjectCannedAcl::PublicRead,
            Access::Private => ObjectCannedAcl::Private,
        };
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .acl(acl)
            .set_content_type(meta.content_type.clone())
            .set_content_disposition(meta.content_disposition.clone())
            .set_cache_control(meta.cache_control.clone())
            .send()
            .await
            .map_err(Self::network)?;
        Ok(size)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        // S3 reports success for missing keys; there's nothing to distinguish.
        self.client.delete_object().bucket(&self.bucket).key(key).send().await.map_err(Self::network)?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => exn::bail!(Self::network(err)),
        };
        let modified = match output.last_modified() {
            Some(dt) => Self::parse_datetime(dt)?,
            None => UtcDateTime::UNIX_EPOCH,
        };
        Ok(FileInfo::new(path, Self::content_length(path, output.content_length())?, modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, "transcodes/abc/abc.mp3", "transcodes/abc/abc.mp3")]
    #[case(Some("encore"), "transcodes/abc/abc.mp3", "encore/transcodes/abc/abc.mp3")]
    #[case(Some("encore/"), "masters/m1.flac", "encore/masters/m1.flac")]
    fn test_join_key(#[case] prefix: Option<&str>, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(join_key(prefix, path), expected);
    }

    #[rstest]
    #[case(None, "transcodes/abc/abc.mp3", "transcodes/abc/abc.mp3")]
    #[case(Some("encore"), "encore/transcodes/abc/abc.mp3", "transcodes/abc/abc.mp3")]
    #[case(Some("encore/"), "encore/masters/m1.flac", "masters/m1.flac")]
    fn test_strip_key(#[case] prefix: Option<&str>, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(strip_key(prefix, key), expected);
    }

    #[test]
    fn test_new_rejects_traversing_prefix() {
        let result = S3Backend::new("s3", "bucket", Some("../up".to_string()), "auto", None::<String>, "id", "secret");
        assert!(result.is_err());
    }
}
