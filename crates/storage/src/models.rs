//! Storage models.

use derive_more::Display;
use std::path::PathBuf;
use time::UtcDateTime;

/// Blob metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative path from storage root
    pub path: PathBuf,
    /// Blob size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
}
impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: UtcDateTime) -> Self {
        Self { path: path.into(), size, modified }
    }
}

/// Who may fetch an uploaded blob directly from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum Access {
    #[default]
    #[display("private")]
    Private,
    #[display("public-read")]
    Public,
}

/// Object metadata attached to an upload.
///
/// Backends that have nowhere to keep these (the local filesystem) ignore
/// them; the content is stored either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMeta {
    pub content_type: Option<String>,
    pub access: Access,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
}
impl BlobMeta {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self { content_type: Some(content_type.into()), ..Default::default() }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }
}
