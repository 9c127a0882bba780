//! Local filesystem storage backend.
//!
//! Blobs are stored as plain files under a configured root directory and
//! accessed via `tokio::fs`.

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::ErrorKind;
use crate::{BlobMeta, FileInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use encore_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/srv/encore/blobs")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend rooted at an absolute path.
    ///
    /// The root directory is created if it doesn't exist yet.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once at startup; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn metadata(path: &Path, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        Ok(FileInfo::new(path, metadata.len(), UtcDateTime::from(modified)))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn ensure_parent(&self, absolute: &Path, relative: &Path) -> Result<()> {
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, relative))?;
        }
        Ok(())
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Keep walking towards the prefix, but don't wander off sideways.
            return Ok(match prefix {
                Some(pfx) if !(relative.starts_with(pfx) || pfx.starts_with(&relative)) => WalkEntry::Skip,
                _ => WalkEntry::Descend(path),
            });
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::metadata(&relative, metadata)?));
        }
        // Most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stream(&self, path: &Path) -> Result<BoxAsyncRead> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        self.ensure_parent(&abs_path, path).await?;
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn upload(&self, path: &Path, local: &Path, meta: &BlobMeta) -> Result<u64> {
        let abs_path = self.absolute_path(path)?;
        self.ensure_parent(&abs_path, path).await?;
        tracing::trace!(
            path = %path.display(),
            content_type = meta.content_type.as_deref(),
            "Filesystem backend does not keep object metadata"
        );
        Ok(fs::copy(local, &abs_path).await.map_err(|e| Self::map_io_error(e, local))?)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Self::metadata(path, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("local", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("local", "relative/path").is_err());
    }

    #[test]
    fn test_absolute_path_rejects_traversal() {
        let (dir, backend) = backend();
        let expected = dir.path().join("masters/m1.flac");
        assert_eq!(backend.absolute_path("masters/m1.flac").unwrap(), expected);
        assert!(backend.absolute_path("../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_dir, backend) = backend();
        backend.write(Path::new("masters/m1.flac"), b"fLaC").await.unwrap();
        assert_eq!(backend.read(Path::new("masters/m1.flac")).await.unwrap(), b"fLaC");
        assert!(backend.exists(Path::new("masters/m1.flac")).await.unwrap());
        assert!(!backend.exists(Path::new("masters/m2.flac")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stream() {
        let (_dir, backend) = backend();
        backend.write(Path::new("m.wav"), b"RIFF....WAVE").await.unwrap();
        let mut reader = backend.stream(Path::new("m.wav")).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_stream_missing_blob() {
        let (_dir, backend) = backend();
        let err = backend.stream(Path::new("missing.flac")).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_creates_directories() {
        let (dir, backend) = backend();
        let local = dir.path().join("scratch.mp3");
        std::fs::write(&local, b"ID3 data").unwrap();
        let size = backend
            .upload(Path::new("transcodes/abc/abcdef.mp3"), &local, &BlobMeta::new("audio/mpeg"))
            .await
            .unwrap();
        assert_eq!(size, 8);
        assert_eq!(backend.read(Path::new("transcodes/abc/abcdef.mp3")).await.unwrap(), b"ID3 data");
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, backend) = backend();
        backend.write(Path::new("file.ogg"), b"OggS").await.unwrap();
        backend.delete(Path::new("file.ogg")).await.unwrap();
        assert!(!backend.exists(Path::new("file.ogg")).await.unwrap());
        let err = backend.delete(Path::new("file.ogg")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let (_dir, backend) = backend();
        backend.write(Path::new("file.opus"), b"OpusHead").await.unwrap();
        let info = backend.stat(Path::new("file.opus")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("file.opus"));
        assert_eq!(info.size, 8);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let (_dir, backend) = backend();
        backend.write(Path::new("transcodes/ab/ab1.mp3"), b"1").await.unwrap();
        backend.write(Path::new("transcodes/ab/ab2.mp3"), b"2").await.unwrap();
        backend.write(Path::new("transcodes/abc/abc1.mp3"), b"3").await.unwrap();
        backend.write(Path::new("masters/m1.flac"), b"4").await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 4);
        assert_eq!(backend.list(Some(Path::new("transcodes"))).await.unwrap().len(), 3);
        let files = backend.list(Some(Path::new("transcodes/ab"))).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.path.starts_with("transcodes/ab")));
        assert!(backend.list(Some(Path::new("nonexistent"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
    }
}
