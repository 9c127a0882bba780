use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use time::UtcDateTime;

/// Identity of a produced artifact: which master, encoded to which format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{master}:{format}")]
pub struct CacheKey {
    pub master: String,
    pub format: String,
}
impl CacheKey {
    pub fn new(master: impl Into<String>, format: impl Into<String>) -> Self {
        Self { master: master.into(), format: format.into() }
    }
}

/// A catalog row: where the artifact for a [`CacheKey`] lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: CacheKey,
    pub blob_path: PathBuf,
    pub size: u64,
    pub created_at: UtcDateTime,
    pub last_accessed_at: UtcDateTime,
}
impl Artifact {
    /// A freshly produced artifact, created and last accessed right now.
    pub fn new(key: CacheKey, blob_path: impl Into<PathBuf>, size: u64) -> Self {
        let now = UtcDateTime::now();
        Self { key, blob_path: blob_path.into(), size, created_at: now, last_accessed_at: now }
    }

    pub fn with_last_accessed(mut self, at: UtcDateTime) -> Self {
        self.last_accessed_at = at;
        self
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ArtifactRow {
    pub(crate) master: String,
    pub(crate) format: String,
    pub(crate) blob_path: String,
    pub(crate) size: i64,
    pub(crate) created_at: i64,
    pub(crate) last_accessed_at: i64,
}
impl TryFrom<&Artifact> for ArtifactRow {
    type Error = Error;
    fn try_from(artifact: &Artifact) -> Result<Self, Self::Error> {
        Ok(Self {
            master: artifact.key.master.clone(),
            format: artifact.key.format.clone(),
            blob_path: artifact.blob_path.to_str().ok_or_raise(|| ErrorKind::InvalidData("blob path"))?.to_string(),
            size: i64::try_from(artifact.size).or_raise(|| ErrorKind::InvalidData("artifact size"))?,
            created_at: artifact.created_at.unix_timestamp(),
            last_accessed_at: artifact.last_accessed_at.unix_timestamp(),
        })
    }
}
impl TryFrom<ArtifactRow> for Artifact {
    type Error = Error;
    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: CacheKey { master: row.master, format: row.format },
            blob_path: PathBuf::from(row.blob_path),
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("artifact size"))?,
            created_at: UtcDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("creation date"))?,
            last_accessed_at: UtcDateTime::from_unix_timestamp(row.last_accessed_at)
                .or_raise(|| ErrorKind::InvalidData("last access date"))?,
        })
    }
}
