//! Self-healing artifact lookup.

use crate::Repository;
use crate::error::{ErrorKind, Result};
use crate::models::Artifact;
use encore_storage::BackendHandle;
use exn::ResultExt;
use time::UtcDateTime;

/// Outcome of looking up a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The exact format is cached and its blob exists.
    Hit(Artifact),
    /// The exact format isn't cached, but one of the formats it can be cheaply
    /// derived from is. Carries the source artifact.
    ShortcutHit(Artifact),
    Miss,
}

/// Catalog rows checked against the blob store they point into.
#[derive(Clone)]
pub struct Catalog {
    repo: Repository,
    backend: BackendHandle,
}
impl Catalog {
    pub fn new(repo: Repository, backend: BackendHandle) -> Self {
        Self { repo, backend }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Find the artifact for `(master, format)`, falling back to any cached
    /// artifact of `shortcut_sources` (in order).
    ///
    /// Every candidate's blob is confirmed to exist. A row whose blob has
    /// vanished is stale: it gets deleted and the next candidate is tried.
    /// With `touch`, an exact hit is marked as used for retention.
    #[tracing::instrument(skip(self, shortcut_sources))]
    pub async fn find<S: AsRef<str>>(
        &self,
        master: &str,
        format: &str,
        shortcut_sources: &[S],
        touch: bool,
    ) -> Result<Lookup> {
        let mut formats = Vec::with_capacity(shortcut_sources.len() + 1);
        formats.push(format);
        formats.extend(shortcut_sources.iter().map(|s| s.as_ref()).filter(|s| *s != format));
        for mut artifact in self.repo.find_candidates(master, &formats).await? {
            let exists = self.backend.exists(&artifact.blob_path).await.or_raise(|| ErrorKind::Storage)?;
            if !exists {
                tracing::warn!(
                    key = %artifact.key,
                    blob = %artifact.blob_path.display(),
                    "Stale artifact: blob is missing from storage; deleting catalog row"
                );
                self.repo.delete(&artifact).await?;
                continue;
            }
            if artifact.key.format != format {
                return Ok(Lookup::ShortcutHit(artifact));
            }
            if touch {
                let now = UtcDateTime::now();
                self.repo.touch(&artifact.key, now).await?;
                artifact.last_accessed_at = now;
            }
            return Ok(Lookup::Hit(artifact));
        }
        Ok(Lookup::Miss)
    }

    pub async fn insert(&self, artifact: &Artifact) -> Result<()> {
        self.repo.insert(artifact).await
    }

    pub async fn for_master(&self, master: &str) -> Result<Vec<Artifact>> {
        self.repo.for_master(master).await
    }

    pub async fn delete(&self, artifact: &Artifact) -> Result<bool> {
        self.repo.delete(artifact).await
    }

    pub async fn delete_expired(&self, artifact: &Artifact, cutoff: UtcDateTime) -> Result<bool> {
        self.repo.delete_expired(artifact, cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheKey, Database};
    use encore_storage::backend::MockBackend;
    use encore_storage::StorageBackend;
    use std::path::Path;
    use std::sync::Arc;
    use time::Duration;

    const NONE: [&str; 0] = [];

    async fn catalog(files: &[&str]) -> (Database, Arc<MockBackend>, Catalog) {
        let db = Database::connect_in_memory().await.unwrap();
        let backend = Arc::new(MockBackend::with_files(files.iter().map(|f| (*f, b"data".to_vec()))));
        let catalog = Catalog::new(Repository::from(&db), backend.clone());
        (db, backend, catalog)
    }

    fn artifact(master: &str, format: &str, path: &str) -> Artifact {
        Artifact::new(CacheKey::new(master, format), path, 4)
    }

    #[tokio::test]
    async fn test_miss_on_empty_catalog() {
        let (_db, _backend, catalog) = catalog(&[]).await;
        assert_eq!(catalog.find("m1", "FLAC", &NONE, true).await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_hit_touches_row() {
        let (_db, _backend, catalog) = catalog(&["t/a.flac"]).await;
        let stale_access = UtcDateTime::now() - Duration::days(3);
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac").with_last_accessed(stale_access)).await.unwrap();
        let Lookup::Hit(found) = catalog.find("m1", "FLAC", &NONE, true).await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(found.blob_path, Path::new("t/a.flac"));
        let row = catalog.repository().get(&found.key).await.unwrap().unwrap();
        assert!(row.last_accessed_at > stale_access);
    }

    #[tokio::test]
    async fn test_probe_does_not_touch() {
        let (_db, _backend, catalog) = catalog(&["t/a.flac"]).await;
        let stale_access = (UtcDateTime::now() - Duration::days(3)).replace_nanosecond(0).unwrap();
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac").with_last_accessed(stale_access)).await.unwrap();
        assert!(matches!(catalog.find("m1", "FLAC", &NONE, false).await.unwrap(), Lookup::Hit(_)));
        let row = catalog.repository().get(&CacheKey::new("m1", "FLAC")).await.unwrap().unwrap();
        assert_eq!(row.last_accessed_at, stale_access);
    }

    #[tokio::test]
    async fn test_exact_hit_preferred_over_shortcut() {
        let (_db, _backend, catalog) = catalog(&["t/a.flac", "t/a.mka"]).await;
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac")).await.unwrap();
        catalog.insert(&artifact("m1", "MKA", "t/a.mka")).await.unwrap();
        let lookup = catalog.find("m1", "MKA", &["FLAC"], true).await.unwrap();
        assert!(matches!(lookup, Lookup::Hit(a) if a.key.format == "MKA"));
    }

    #[tokio::test]
    async fn test_shortcut_hit() {
        let (_db, _backend, catalog) = catalog(&["t/a.flac"]).await;
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac")).await.unwrap();
        let lookup = catalog.find("m1", "MKA", &["WAV", "FLAC"], true).await.unwrap();
        assert!(matches!(lookup, Lookup::ShortcutHit(a) if a.key.format == "FLAC"));
    }

    #[tokio::test]
    async fn test_stale_row_is_deleted() {
        let (_db, backend, catalog) = catalog(&["t/a.flac"]).await;
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac")).await.unwrap();
        backend.delete(Path::new("t/a.flac")).await.unwrap();
        assert_eq!(catalog.find("m1", "FLAC", &NONE, true).await.unwrap(), Lookup::Miss);
        assert!(catalog.for_master("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_exact_falls_through_to_shortcut() {
        let (_db, _backend, catalog) = catalog(&["t/a.flac"]).await;
        catalog.insert(&artifact("m1", "FLAC", "t/a.flac")).await.unwrap();
        catalog.insert(&artifact("m1", "MKA", "t/gone.mka")).await.unwrap();
        let lookup = catalog.find("m1", "MKA", &["FLAC"], true).await.unwrap();
        assert!(matches!(lookup, Lookup::ShortcutHit(a) if a.key.format == "FLAC"));
        assert!(catalog.repository().get(&CacheKey::new("m1", "MKA")).await.unwrap().is_none());
    }
}
