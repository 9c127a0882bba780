//! Removal of artifacts that haven't been asked for in a while.

use crate::TEST_TRACK;
use crate::error::{ErrorKind, Result};
use encore_cache::Catalog;
use exn::ResultExt;
use futures::TryStreamExt;
use std::path::PathBuf;
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Artifacts unused for at least this long are removed.
    pub max_age: Duration,
    /// Time between sweeps.
    pub interval: Duration,
    /// Masters whose artifacts are never removed.
    pub pinned: Vec<String>,
}

impl RetentionPolicy {
    /// Sweeps run every minute, or every 15 seconds when artifacts live for
    /// less than two minutes.
    pub fn new(max_age: Duration) -> Self {
        let interval = if max_age < Duration::from_secs(120) { Duration::from_secs(15) } else { Duration::from_secs(60) };
        Self { max_age, interval, pinned: vec![TEST_TRACK.to_string()] }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_pinned(mut self, pinned: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.pinned = pinned.into_iter().map(Into::into).collect();
        self
    }

    fn cutoff(&self, now: UtcDateTime) -> UtcDateTime {
        let max_age = time::Duration::try_from(self.max_age).unwrap_or(time::Duration::MAX);
        now.checked_sub(max_age).unwrap_or(UtcDateTime::MIN)
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows past the cutoff when the sweep started.
    pub expired: usize,
    /// Rows deleted along with their blob.
    pub removed: usize,
    /// Rows deleted whose blob could not be.
    pub failed: usize,
}

/// Periodically deletes expired artifacts: catalog row first, then blob.
///
/// A row is only ever deleted once, so when two sweepers race (or a sweep
/// races [`Transcoder::forget_master`](crate::Transcoder::forget_master))
/// exactly one of them goes on to delete the blob.
pub struct RetentionSweeper {
    catalog: Catalog,
    policy: RetentionPolicy,
    blob_prefix: PathBuf,
}

impl RetentionSweeper {
    /// `blob_prefix` is where artifacts are uploaded; it bounds the orphan
    /// scan.
    pub fn new(catalog: Catalog, policy: RetentionPolicy, blob_prefix: impl Into<PathBuf>) -> Self {
        Self { catalog, policy, blob_prefix: blob_prefix.into() }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(UtcDateTime::now()).await
    }

    #[instrument(skip_all, fields(dry_run = self.catalog.repository().is_dry_run()))]
    pub async fn sweep_at(&self, now: UtcDateTime) -> Result<SweepReport> {
        let cutoff = self.policy.cutoff(now);
        let expired = self
            .catalog
            .repository()
            .list_expired(cutoff, &self.policy.pinned)
            .await
            .or_raise(|| ErrorKind::Catalog)?;
        let mut report = SweepReport { expired: expired.len(), ..SweepReport::default() };
        for artifact in expired {
            if !self.catalog.delete_expired(&artifact, cutoff).await.or_raise(|| ErrorKind::Catalog)? {
                // Gone, replaced or used again since it was listed. Whoever
                // deleted the row owns the blob.
                continue;
            }
            match self.catalog.backend().delete(&artifact.blob_path).await {
                Ok(()) => report.removed += 1,
                Err(err) if err.is_not_found() => report.removed += 1,
                Err(err) => {
                    tracing::warn!(key = %artifact.key, blob = %artifact.blob_path.display(), error = %err, "Failed to delete expired artifact blob");
                    report.failed += 1;
                },
            }
        }
        if report.removed > 0 {
            tracing::debug!("Pruned {} old artifact(s)", report.removed);
        }
        Ok(report)
    }

    pub async fn sweep_orphans(&self) -> Result<usize> {
        self.sweep_orphans_at(UtcDateTime::now()).await
    }

    /// Delete blobs under the artifact prefix that no catalog row references.
    ///
    /// Only blobs older than the retention window are touched, so an upload
    /// whose row is about to be written is left alone.
    #[instrument(skip_all, fields(prefix = %self.blob_prefix.display()))]
    pub async fn sweep_orphans_at(&self, now: UtcDateTime) -> Result<usize> {
        let cutoff = self.policy.cutoff(now);
        let backend = self.catalog.backend();
        let blobs: Vec<_> = backend.list_stream(Some(&self.blob_prefix)).try_collect().await.or_raise(|| ErrorKind::Storage)?;
        let mut removed = 0;
        for blob in blobs.into_iter().filter(|blob| blob.modified <= cutoff) {
            if self.catalog.repository().blob_path_exists(&blob.path).await.or_raise(|| ErrorKind::Catalog)? {
                continue;
            }
            match backend.delete(&blob.path).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(blob = %blob.path.display(), error = %err, "Failed to delete orphaned blob"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Deleted orphaned artifact blobs");
        }
        Ok(removed)
    }

    /// Sweep on the policy's interval until `shutdown` changes or closes.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(max_age = ?self.policy.max_age, interval = ?self.policy.interval, "Retention sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = ?err, "Retention sweep failed");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Retention sweeper stopped");
    }
}
