//! Repository for artifact rows.
//!
//! Plain SQL over the `artifacts` table. Whether the referenced blob still
//! exists is not this layer's concern, see [`Catalog`](crate::Catalog).

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{Artifact, ArtifactRow, CacheKey};
use exn::ResultExt;
use sqlx::SqlitePool;
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

/// Repository for managing artifact rows in the catalog database.
///
/// In `dry_run` mode every write is skipped and reported as if it affected a
/// row, so callers follow the same code path they would for real.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    dry_run: bool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone(), dry_run: false }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool, dry_run: bool) -> Self {
        Self { pool, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn json_list<S: AsRef<str>>(items: &[S]) -> Result<String> {
        let items: Vec<&str> = items.iter().map(|s| s.as_ref()).collect();
        serde_json::to_string(&items).or_raise(|| ErrorKind::InvalidData("string list"))
    }

    fn into_models(rows: Vec<ArtifactRow>) -> Result<Vec<Artifact>> {
        rows.into_iter().map(Artifact::try_from).collect()
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Insert an artifact, replacing any existing row for the same key.
    #[instrument(skip_all, fields(key = %artifact.key))]
    pub async fn insert(&self, artifact: &Artifact) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let row = ArtifactRow::try_from(artifact)?;
        sqlx::query(include_str!("../queries/upsert.sql"))
            .bind(row.master)
            .bind(row.format)
            .bind(row.blob_path)
            .bind(row.size)
            .bind(row.created_at)
            .bind(row.last_accessed_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Record that an artifact was just used.
    ///
    /// Returns `true` if a row was updated.
    pub async fn touch(&self, key: &CacheKey, at: UtcDateTime) -> Result<bool> {
        if self.dry_run {
            return Ok(true);
        }
        let result = sqlx::query(include_str!("../queries/touch.sql"))
            .bind(at.unix_timestamp())
            .bind(&key.master)
            .bind(&key.format)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn get(&self, key: &CacheKey) -> Result<Option<Artifact>> {
        let row: Option<ArtifactRow> = sqlx::query_as(include_str!("../queries/get.sql"))
            .bind(&key.master)
            .bind(&key.format)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Artifact::try_from).transpose()
    }

    /// All rows for `master` whose format is one of `formats`.
    ///
    /// Rows come back in the order `formats` lists them, so callers can give
    /// an exact format precedence over its shortcut sources.
    pub async fn find_candidates<S: AsRef<str>>(&self, master: &str, formats: &[S]) -> Result<Vec<Artifact>> {
        if formats.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ArtifactRow> = sqlx::query_as(include_str!("../queries/find_candidates.sql"))
            .bind(master)
            .bind(Self::json_list(formats)?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut artifacts = Self::into_models(rows)?;
        artifacts.sort_by_key(|a| formats.iter().position(|f| f.as_ref() == a.key.format));
        Ok(artifacts)
    }

    /// Every artifact produced from a master.
    pub async fn for_master(&self, master: &str) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(include_str!("../queries/for_master.sql"))
            .bind(master)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::into_models(rows)
    }

    /// Artifacts not accessed since `cutoff` (inclusive), oldest first,
    /// skipping any whose master is listed in `pinned`.
    #[instrument(skip_all, fields(cutoff = cutoff.unix_timestamp()))]
    pub async fn list_expired<S: AsRef<str>>(&self, cutoff: UtcDateTime, pinned: &[S]) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(include_str!("../queries/list_expired.sql"))
            .bind(cutoff.unix_timestamp())
            .bind(Self::json_list(pinned)?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::into_models(rows)
    }

    /// Whether any row references the blob at `path`.
    pub async fn blob_path_exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref().to_str().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidData("blob path")))?;
        let exists: bool = sqlx::query_scalar(include_str!("../queries/blob_path_exists.sql"))
            .bind(path)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(exists)
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("row count"))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete the row for `artifact`, provided it still points at the same
    /// blob. A row replaced since it was read is left alone.
    ///
    /// Returns `true` if a row was deleted, `false` if someone else already
    /// removed or replaced it.
    #[instrument(skip_all, fields(key = %artifact.key))]
    pub async fn delete(&self, artifact: &Artifact) -> Result<bool> {
        if self.dry_run {
            return Ok(true);
        }
        let row = ArtifactRow::try_from(artifact)?;
        let result = sqlx::query(include_str!("../queries/delete.sql"))
            .bind(row.master)
            .bind(row.format)
            .bind(row.blob_path)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Like [`delete`](Self::delete), but also keeps the row if it was
    /// accessed after `cutoff`.
    #[instrument(skip_all, fields(key = %artifact.key, cutoff = cutoff.unix_timestamp()))]
    pub async fn delete_expired(&self, artifact: &Artifact, cutoff: UtcDateTime) -> Result<bool> {
        if self.dry_run {
            return Ok(true);
        }
        let row = ArtifactRow::try_from(artifact)?;
        let result = sqlx::query(include_str!("../queries/delete_expired.sql"))
            .bind(row.master)
            .bind(row.format)
            .bind(row.blob_path)
            .bind(cutoff.unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    async fn repo() -> (Database, Repository) {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        (db, repo)
    }

    fn artifact(master: &str, format: &str) -> Artifact {
        Artifact::new(CacheKey::new(master, format), format!("transcodes/{master}/{format}"), 100)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_db, repo) = repo().await;
        let a = artifact("m1", "MP3_320");
        repo.insert(&a).await.unwrap();
        let found = repo.get(&a.key).await.unwrap().unwrap();
        assert_eq!(found.blob_path, a.blob_path);
        assert_eq!(found.size, 100);
        assert!(repo.get(&CacheKey::new("m1", "FLAC")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_existing_key() {
        let (_db, repo) = repo().await;
        repo.insert(&artifact("m1", "FLAC")).await.unwrap();
        let replacement = Artifact::new(CacheKey::new("m1", "FLAC"), "transcodes/new.flac", 7);
        repo.insert(&replacement).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
        let found = repo.get(&replacement.key).await.unwrap().unwrap();
        assert_eq!(found.blob_path, Path::new("transcodes/new.flac"));
    }

    #[tokio::test]
    async fn test_find_candidates_follows_requested_order() {
        let (_db, repo) = repo().await;
        repo.insert(&artifact("m1", "FLAC")).await.unwrap();
        repo.insert(&artifact("m1", "WAV")).await.unwrap();
        repo.insert(&artifact("m1", "OGG")).await.unwrap();
        repo.insert(&artifact("m2", "MKA")).await.unwrap();
        let found = repo.find_candidates("m1", &["MKA", "WAV", "FLAC"]).await.unwrap();
        let formats: Vec<_> = found.iter().map(|a| a.key.format.as_str()).collect();
        assert_eq!(formats, vec!["WAV", "FLAC"]);
        assert!(repo.find_candidates::<&str>("m1", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch() {
        let (_db, repo) = repo().await;
        let a = artifact("m1", "FLAC").with_last_accessed(UtcDateTime::UNIX_EPOCH);
        repo.insert(&a).await.unwrap();
        let later = UtcDateTime::UNIX_EPOCH + Duration::days(1);
        assert!(repo.touch(&a.key, later).await.unwrap());
        assert_eq!(repo.get(&a.key).await.unwrap().unwrap().last_accessed_at, later);
        assert!(!repo.touch(&CacheKey::new("nope", "FLAC"), later).await.unwrap());
    }

    #[tokio::test]
    async fn test_for_master() {
        let (_db, repo) = repo().await;
        repo.insert(&artifact("m1", "FLAC")).await.unwrap();
        repo.insert(&artifact("m1", "MP3_V0")).await.unwrap();
        repo.insert(&artifact("m2", "FLAC")).await.unwrap();
        let found = repo.for_master("m1").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.key.master == "m1"));
    }

    #[tokio::test]
    async fn test_delete_reports_rows_affected() {
        let (_db, repo) = repo().await;
        let a = artifact("m1", "FLAC");
        repo.insert(&a).await.unwrap();
        assert!(repo.delete(&a).await.unwrap());
        assert!(!repo.delete(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_keeps_replaced_row() {
        let (_db, repo) = repo().await;
        let stale = artifact("m1", "FLAC");
        repo.insert(&stale).await.unwrap();
        let replacement = Artifact::new(stale.key.clone(), "transcodes/new.flac", 7);
        repo.insert(&replacement).await.unwrap();
        assert!(!repo.delete(&stale).await.unwrap());
        assert_eq!(repo.get(&stale.key).await.unwrap().unwrap().blob_path, Path::new("transcodes/new.flac"));
    }

    #[tokio::test]
    async fn test_delete_expired_keeps_touched_row() {
        let (_db, repo) = repo().await;
        let cutoff = UtcDateTime::UNIX_EPOCH + Duration::days(10);
        let a = artifact("m1", "FLAC").with_last_accessed(cutoff - Duration::days(1));
        repo.insert(&a).await.unwrap();
        // Used again between the sweep's listing and its delete.
        assert!(repo.touch(&a.key, cutoff + Duration::seconds(1)).await.unwrap());
        assert!(!repo.delete_expired(&a, cutoff).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);

        assert!(repo.touch(&a.key, cutoff).await.unwrap());
        assert!(repo.delete_expired(&a, cutoff).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_expired_boundary_and_pins() {
        let (_db, repo) = repo().await;
        let now = UtcDateTime::now();
        let cutoff = now - Duration::hours(1);
        repo.insert(&artifact("old", "FLAC").with_last_accessed(cutoff - Duration::seconds(1))).await.unwrap();
        repo.insert(&artifact("exact", "FLAC").with_last_accessed(cutoff)).await.unwrap();
        repo.insert(&artifact("fresh", "FLAC").with_last_accessed(cutoff + Duration::seconds(1))).await.unwrap();
        repo.insert(&artifact("__testtrack", "FLAC").with_last_accessed(UtcDateTime::UNIX_EPOCH)).await.unwrap();
        let expired = repo.list_expired(cutoff, &["__testtrack"]).await.unwrap();
        let masters: Vec<_> = expired.iter().map(|a| a.key.master.as_str()).collect();
        assert_eq!(masters, vec!["old", "exact"]);
    }

    #[tokio::test]
    async fn test_blob_path_exists() {
        let (_db, repo) = repo().await;
        repo.insert(&artifact("m1", "FLAC")).await.unwrap();
        assert!(repo.blob_path_exists("transcodes/m1/FLAC").await.unwrap());
        assert!(!repo.blob_path_exists("transcodes/m1/WAV").await.unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_skips_writes() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::new(db.pool().clone(), true);
        let a = artifact("m1", "FLAC");
        repo.insert(&a).await.unwrap();
        assert!(repo.delete(&a).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
