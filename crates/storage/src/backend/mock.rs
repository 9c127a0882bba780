//! In-memory storage backend for testing.

use super::{BoxAsyncRead, FileInfoStream};
use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::models::{BlobMeta, FileInfo};
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::sync::RwLock;

struct Blob {
    inserted: UtcDateTime,
    data: Vec<u8>,
    meta: BlobMeta,
}

/// In-memory storage backend for testing.
///
/// Blobs are kept in a `HashMap` behind a [`RwLock`], together with the
/// [`BlobMeta`] they were uploaded with so tests can assert on it.
///
/// # Examples
///
/// ```
/// use encore_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("masters/m1.flac", b"fLaC")]);
/// assert!(backend.exists(Path::new("masters/m1.flac")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Blob>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with blobs.
    ///
    /// Panics if any path fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, Blob { inserted: now, data: data.into(), meta: BlobMeta::default() });
        }
        Self { name: "mock".to_string(), storage: RwLock::new(map) }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Metadata a blob was stored with, if it exists.
    pub async fn meta(&self, path: impl AsRef<Path>) -> Option<BlobMeta> {
        let path = validate_path(path.as_ref()).ok()?;
        self.storage.read().await.get(&path).map(|blob| blob.meta.clone())
    }

    /// Number of blobs currently stored.
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }

    async fn insert(&self, path: PathBuf, data: Vec<u8>, meta: BlobMeta) {
        let blob = Blob { inserted: UtcDateTime::now(), data, meta };
        self.storage.write().await.insert(path, blob);
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            // Snapshot under the read lock; never hold it across a yield.
            let entries: Vec<FileInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| validated_prefix.as_ref().is_none_or(|pfx| path.starts_with(pfx)))
                    .map(|(path, blob)| FileInfo::new(path.clone(), blob.data.len() as u64, blob.inserted))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let blob = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(blob.data.clone())
    }

    async fn stream(&self, path: &Path) -> Result<BoxAsyncRead> {
        let data = self.read(path).await?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.insert(path, data.to_vec(), BlobMeta::default()).await;
        Ok(())
    }

    async fn upload(&self, path: &Path, local: &Path, meta: &BlobMeta) -> Result<u64> {
        let path = validate_path(path)?;
        let data = tokio::fs::read(local).await.map_err(ErrorKind::Io)?;
        let size = data.len() as u64;
        self.insert(path, data, meta.clone()).await;
        Ok(size)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let blob = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(FileInfo::new(path.clone(), blob.data.len() as u64, blob.inserted))
    }
}
