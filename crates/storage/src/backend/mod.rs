//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for blob operations across different backends (local filesystem,
//! S3-compatible services, etc.).

mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use crate::models::{BlobMeta, FileInfo};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Unified interface for blob storage.
///
/// Masters are read from here and produced artifacts are uploaded here. All
/// paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use encore_storage::{backend::StorageBackend, error::Result};
///
/// async fn master_size(backend: &dyn StorageBackend) -> Result<u64> {
///     let path = Path::new("masters/m1.flac");
///     match backend.exists(path).await? {
///         true => Ok(backend.stat(path).await?.size),
///         false => Ok(0),
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// List all blobs matching an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`].
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream blob metadata matching an optional prefix.
    ///
    /// Prefixes are component-based: `transcodes/ab` matches
    /// `transcodes/ab/x.mp3` but not `transcodes/abc/x.mp3`. Asking for a
    /// prefix that doesn't exist yields an empty stream, not an error.
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a>;

    /// Check if a blob exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read the complete contents of a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open a blob for streaming reads.
    ///
    /// The async setup (opening the file/connection) happens before
    /// returning, so a missing blob is reported here as
    /// [`NotFound`](crate::error::ErrorKind::NotFound) rather than on the
    /// first read.
    async fn stream(&self, path: &Path) -> Result<BoxAsyncRead>;

    /// Write blob contents, creating or overwriting.
    ///
    /// Implementations should create parent directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Upload a local file as a blob, attaching object metadata.
    ///
    /// Returns the number of bytes stored.
    async fn upload(&self, path: &Path, local: &Path, meta: &BlobMeta) -> Result<u64>;

    /// Delete a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist (where the backend can tell).
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get blob metadata without reading contents.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}
