//! Read-only storage backend.
//!
//! Wraps another backend and prevents write operations from executing while
//! still indicating success. Used for dry-run retention sweeps.

use async_trait::async_trait;
use std::path::Path;

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::{BackendHandle, BlobMeta, FileInfo, StorageBackend};

/// Read-only storage backend.
///
/// Silently drops all write operations, logging an
/// [`info event`](tracing::Event) for each.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn stream(&self, path: &Path) -> Result<BoxAsyncRead> {
        self.inner.stream(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(path = %path.display(), bytes = data.len(), "Skipping write during read-only mode");
        Ok(())
    }

    async fn upload(&self, path: &Path, local: &Path, _meta: &BlobMeta) -> Result<u64> {
        let size = tokio::fs::metadata(local).await.map_err(ErrorKind::Io)?.len();
        tracing::info!(path = %path.display(), bytes = size, "Skipping upload during read-only mode");
        Ok(size)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Skipping delete during read-only mode");
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path).await
    }
}
