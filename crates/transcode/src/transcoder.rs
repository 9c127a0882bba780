use crate::art::{self, Art};
use crate::error::{ErrorKind, Result};
use crate::invocation::Invocation;
use crate::mutex::{InFlight, Mutexes, Slot};
use crate::naming::{cache_control, content_disposition, download_filename, random_blob_path};
use crate::request::{Delivery, Master, Origin, Production, Request, Status};
use encore_cache::{Artifact, CacheKey, Catalog, Lookup};
use encore_formats::{Format, Formats, Shortcut};
use encore_pipeline::{BoxAsyncWrite, Metadata, Output, Pipeline, Source};
use encore_storage::{Access, BackendHandle, BlobMeta};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{Instrument, instrument};

const STREAMING_NOTE: &str = ". Low-quality encode for streaming; consider downloading a real copy.";

#[derive(Debug, Clone)]
pub struct Settings {
    pub ffmpeg: String,
    /// ImageMagick, used to measure cover art for Ogg picture tags.
    pub magick: String,
    /// Parent of the per-production scratch directories.
    pub work_dir: PathBuf,
    /// Storage prefix new artifacts are uploaded under.
    pub blob_prefix: PathBuf,
    /// Wall-clock limit on a single encoder pipeline.
    pub timeout: Option<Duration>,
    /// Limit on waiting for another caller's production of the same key.
    pub wait_timeout: Option<Duration>,
    /// Productions nobody is streaming live run at most this many at a time.
    pub max_concurrent: usize,
    pub allow_encumbered: bool,
    /// Written to every artifact's comment tag.
    pub comment: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            magick: "magick".to_string(),
            work_dir: std::env::temp_dir().join("encore").join("work"),
            blob_prefix: PathBuf::from("transcodes"),
            timeout: None,
            wait_timeout: None,
            max_concurrent: std::thread::available_parallelism().map_or(2, usize::from),
            allow_encumbered: false,
            comment: format!("Generated by encore v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// How a production gets its audio.
#[derive(Debug, Clone)]
enum Plan {
    /// Encode the master with the format's own arguments.
    Full,
    /// Remux an already cached artifact of another format.
    Shortcut { shortcut: Shortcut, source: Artifact },
}

/// Result of consulting the catalog.
enum Found {
    Cached(Artifact),
    Produce(Plan),
}

/// Obtains artifacts, producing each `(master, format)` at most once at a time.
///
/// Clones share the in-flight table and the production permits.
#[derive(Clone)]
pub struct Transcoder {
    catalog: Catalog,
    storage: BackendHandle,
    formats: Arc<Formats>,
    settings: Arc<Settings>,
    mutexes: Mutexes,
    permits: Arc<Semaphore>,
}

impl Transcoder {
    /// Artifacts are stored in the catalog's blob store.
    pub fn new(catalog: Catalog, formats: Arc<Formats>, settings: Settings) -> Self {
        let storage = Arc::clone(catalog.backend());
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self { catalog, storage, formats, settings: Arc::new(settings), mutexes: Mutexes::new(), permits }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn formats(&self) -> &Formats {
        &self.formats
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mutexes(&self) -> &Mutexes {
        &self.mutexes
    }

    /// Refuse to start new background productions. Running ones finish.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Return the artifact for a request, producing it if needed.
    ///
    /// Concurrent requests for the same master and cached format share a
    /// single production: one caller runs the encoder while the rest wait
    /// for it and then find its artifact in the catalog. A failed production
    /// writes no catalog row and leaves the key free for the next attempt.
    ///
    /// A production that will be cached runs on its own task: dropping the
    /// returned future stops waiting for it but does not stop it.
    #[instrument(skip_all, fields(master = %request.master.id, format = %request.format))]
    pub async fn obtain_or_produce(&self, request: Request) -> Result<Production> {
        let Request { master, format: name, delivery } = request;
        let format = Arc::clone(self.formats.by_name(&name).ok_or_raise(|| ErrorKind::UnknownFormat(name.clone()))?);
        if !format.available(self.settings.allow_encumbered) {
            exn::bail!(ErrorKind::FormatUnavailable(name));
        }
        let filename = download_filename(&master.tags, &format.extension);
        let key = CacheKey::new(&master.id, &format.name);
        let (probe, mut live) = match delivery {
            Delivery::Probe => (true, None),
            Delivery::Prepare => (false, None),
            Delivery::Stream(writer) => (false, Some(writer).filter(|_| format.direct)),
        };

        loop {
            let plan = match self.consult(&key, &format, !probe).await? {
                Found::Cached(artifact) => return Ok(Production::new(Status::Cached, Some(artifact), filename)),
                _ if probe => return Ok(Production::new(Status::Unavailable, None, filename)),
                Found::Produce(plan) => plan,
            };

            if !format.cache {
                // Output only ever goes to the caller; nothing to share.
                if let Some(writer) = live.take() {
                    let source = self.open_source(&master, &plan).await?;
                    self.produce(&key, &master, &format, &plan, source, Some(writer), false).await?;
                }
                return Ok(Production::new(Status::Direct, None, filename));
            }

            let claim = match self.mutexes.claim(&key) {
                Slot::Claimed(claim) => claim,
                Slot::InFlight(in_flight) => {
                    self.wait(in_flight, &key).await?;
                    continue;
                },
            };
            // The previous producer may have finished between our lookup and
            // the claim.
            let plan = match self.consult(&key, &format, true).await? {
                Found::Cached(artifact) => return Ok(Production::new(Status::Cached, Some(artifact), filename)),
                Found::Produce(plan) => plan,
            };
            let source = match self.open_source(&master, &plan).await {
                Ok(source) => source,
                Err(err) => {
                    if let (ErrorKind::StaleArtifact(stale), Plan::Shortcut { source, .. }) = (&*err, &plan) {
                        tracing::warn!(key = %stale, blob = %source.blob_path.display(), "Shortcut source vanished; deleting catalog row");
                        self.catalog.delete(source).await.or_raise(|| ErrorKind::Catalog)?;
                        drop(claim);
                        continue;
                    }
                    return Err(err);
                },
            };
            let status = match (&plan, live.is_some()) {
                (_, true) => Status::DirectWillCache,
                (Plan::Shortcut { .. }, false) => Status::Shortcut,
                (Plan::Full, false) => Status::Fresh,
            };
            let this = self.clone();
            let (task_key, task_master, task_format, task_live) = (key.clone(), master.clone(), Arc::clone(&format), live.take());
            let production = tokio::spawn(
                async move {
                    let result = this.produce(&task_key, &task_master, &task_format, &plan, source, task_live, true).await;
                    // Catalog row is in place; waiters will find it once the claim drops.
                    drop(claim);
                    result
                }
                .in_current_span(),
            );
            let artifact = production.await.or_raise(|| ErrorKind::ProductionFailed(key.clone()))??;
            tracing::debug!(key = %key, status = %status, "Production finished");
            return Ok(Production::new(status, artifact, filename));
        }
    }

    /// Remove every artifact of a master that no longer exists.
    #[instrument(skip(self))]
    pub async fn forget_master(&self, master: &str) -> Result<usize> {
        let mut removed = 0;
        for artifact in self.catalog.for_master(master).await.or_raise(|| ErrorKind::Catalog)? {
            if !self.catalog.delete(&artifact).await.or_raise(|| ErrorKind::Catalog)? {
                continue;
            }
            removed += 1;
            if let Err(err) = self.storage.delete(&artifact.blob_path).await {
                tracing::warn!(key = %artifact.key, blob = %artifact.blob_path.display(), error = %err, "Failed to delete artifact blob");
            }
        }
        tracing::debug!(removed, "Forgot master");
        Ok(removed)
    }

    async fn consult(&self, key: &CacheKey, format: &Format, touch: bool) -> Result<Found> {
        let lookup = self
            .catalog
            .find(&key.master, &key.format, &format.shortcut_sources(), touch)
            .await
            .or_raise(|| ErrorKind::Catalog)?;
        Ok(match lookup {
            Lookup::Hit(artifact) => Found::Cached(artifact),
            Lookup::ShortcutHit(source) => match format.shortcut_from(&source.key.format) {
                Some(shortcut) => Found::Produce(Plan::Shortcut { shortcut: shortcut.clone(), source }),
                None => Found::Produce(Plan::Full),
            },
            Lookup::Miss => Found::Produce(Plan::Full),
        })
    }

    async fn wait(&self, in_flight: InFlight, key: &CacheKey) -> Result<()> {
        tracing::debug!(key = %key, "Waiting for in-flight production");
        match self.settings.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, in_flight.finished())
                .await
                .or_raise(|| ErrorKind::ProductionRaceTimeout(key.clone())),
            None => {
                in_flight.finished().await;
                Ok(())
            },
        }
    }

    async fn open_source(&self, master: &Master, plan: &Plan) -> Result<Source> {
        match (plan, master.origin) {
            (Plan::Shortcut { source, .. }, _) => match self.storage.stream(&source.blob_path).await {
                Ok(reader) => Ok(Source::Reader(reader)),
                Err(err) if err.is_not_found() => Err(err.raise(ErrorKind::StaleArtifact(source.key.clone()))),
                Err(err) => Err(err.raise(ErrorKind::Storage)),
            },
            (Plan::Full, Origin::Silence { seconds }) => Ok(Source::Silence { seconds }),
            (Plan::Full, Origin::Blob) => match self.storage.stream(Path::new(&master.id)).await {
                Ok(reader) => Ok(Source::Reader(reader)),
                Err(err) => {
                    tracing::error!(master = %master.id, error = %err, "Master is missing");
                    Err(err.raise(ErrorKind::SourceMissing(master.id.clone())))
                },
            },
        }
    }

    /// Run one production. With `cache`, the output is uploaded and recorded
    /// in the catalog before this returns.
    #[allow(clippy::too_many_arguments)]
    async fn produce(
        &self,
        key: &CacheKey,
        master: &Master,
        format: &Format,
        plan: &Plan,
        source: Source,
        live: Option<BoxAsyncWrite>,
        cache: bool,
    ) -> Result<Option<Artifact>> {
        let _permit = match live {
            Some(_) => None,
            None => Some(self.permits.acquire().await.or_raise(|| ErrorKind::ShuttingDown)?),
        };
        match plan {
            Plan::Full => tracing::debug!(key = %key, "Transcoding from master"),
            Plan::Shortcut { source, .. } => tracing::debug!(key = %key, source = %source.key.format, "Remuxing from cached artifact"),
        }

        tokio::fs::create_dir_all(&self.settings.work_dir).await.or_raise(|| ErrorKind::WorkDir)?;
        let work = tempfile::Builder::new()
            .prefix("transcode-")
            .tempdir_in(&self.settings.work_dir)
            .or_raise(|| ErrorKind::WorkDir)?;

        let art = match &master.art {
            Some(path) if art::wants_art(format) => {
                art::prepare(&self.storage, &self.settings.magick, path, format, work.path()).await?
            },
            _ => None,
        };
        let metadata = track_metadata(&self.settings, master, format, art.as_ref())
            .write_temp(work.path())
            .or_raise(|| ErrorKind::WorkDir)?;

        let cache_path = work.path().join(format!("out.{}", format.extension));
        let output = match live {
            Some(live) if cache => Output::Fork { cache: cache_path, live },
            Some(live) => Output::Stream(live),
            None => Output::File(cache_path),
        };
        let shortcut = match plan {
            Plan::Shortcut { shortcut, .. } => Some(shortcut),
            Plan::Full => None,
        };
        let stages = Invocation {
            ffmpeg: &self.settings.ffmpeg,
            format,
            shortcut,
            silence: shortcut.is_none() && matches!(master.origin, Origin::Silence { .. }),
            metadata: metadata.path(),
            art: art.as_ref().and_then(Art::attached),
            target: output.target(),
        }
        .stages();

        let completion = match Pipeline::new(stages, source, output).with_timeout(self.settings.timeout).run().await {
            Ok(completion) => completion,
            Err(err) => {
                let diagnostics = err.diagnostics().map_or_else(|| err.to_string(), str::to_string);
                return Err(err.raise(ErrorKind::PipelineFailure(diagnostics)));
            },
        };
        let Some(local) = completion.cache_path.filter(|_| cache) else {
            return Ok(None);
        };
        self.store(key, master, format, &local).await.map(Some)
    }

    /// Upload a finished artifact and record it.
    async fn store(&self, key: &CacheKey, master: &Master, format: &Format, local: &Path) -> Result<Artifact> {
        let blob = loop {
            let candidate = random_blob_path(&self.settings.blob_prefix, &format.extension);
            if !self.storage.exists(&candidate).await.or_raise(|| ErrorKind::Storage)? {
                break candidate;
            }
        };
        let filename = download_filename(&master.tags, &format.extension);
        let meta = BlobMeta::new(&format.mime_type)
            .with_access(Access::Public)
            .with_disposition(content_disposition(format, &filename))
            .with_cache_control(cache_control(master.tags.published));
        let size = self
            .storage
            .upload(&blob, local, &meta)
            .await
            .or_raise(|| ErrorKind::ProductionFailed(key.clone()))?;

        let artifact = Artifact::new(key.clone(), &blob, size);
        if let Err(err) = self.catalog.insert(&artifact).await {
            if let Err(cleanup) = self.storage.delete(&blob).await {
                tracing::warn!(blob = %blob.display(), error = %cleanup, "Failed to remove unrecorded artifact blob");
            }
            return Err(err.raise(ErrorKind::ProductionFailed(key.clone())));
        }
        tracing::debug!(key = %key, blob = %blob.display(), size, "Stored artifact");
        Ok(artifact)
    }
}

fn track_metadata(settings: &Settings, master: &Master, format: &Format, art: Option<&Art>) -> Metadata {
    let tags = &master.tags;
    let mut meta = Metadata::new();
    match &tags.album {
        Some(album) => meta.set("title", tags.title.as_str()).set("album", album.as_str()),
        None => meta.set("title", format!("{} (Full Album)", tags.title)).set("album", tags.title.as_str()),
    };
    meta.set("artist", tags.artist.as_str())
        .set_opt("date", tags.year.map(|y| y.to_string()))
        .set_opt("track", tags.track.filter(|t| *t > 0).map(|t| t.to_string()))
        .set_opt("unsyncedlyrics", tags.lyrics.as_deref())
        .set_opt("metadata_block_picture", art.and_then(Art::block));
    let note = if format.usage.can_download() { "" } else { STREAMING_NOTE };
    meta.set("comment", format!("{}{note}", settings.comment));
    for (tag, value) in format.replaygain_tags(&tags.replaygain) {
        meta.set(tag, value);
    }
    meta
}
