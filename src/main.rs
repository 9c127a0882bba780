mod error;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use encore_cache::{Catalog, Database, Repository};
use encore_config::{Config, StorageConfig};
use encore_formats::Formats;
use encore_storage::backend::{LocalBackend, ReadOnlyBackend};
use encore_storage::{BackendHandle, StorageBackend};
use encore_transcode::{
    Delivery, Master, Request, RetentionPolicy, RetentionSweeper, Settings, Status, TEST_TRACK, TrackTags, Transcoder,
};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Cached, deduplicated transcodes of audio masters.
#[derive(Parser, Debug)]
#[command(name = "encore", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Obtain a master in a format, producing and caching it when needed.
    Transcode {
        /// Storage path of the master, or `__testtrack` for generated silence.
        master: String,
        /// Format name, e.g. `MP3_320`.
        format: String,
        /// Write the audio to this file, or `-` for standard output.
        #[arg(short, long, conflicts_with_all = ["probe", "prepare"])]
        output: Option<PathBuf>,
        /// Only report whether the artifact is cached.
        #[arg(long, conflicts_with = "prepare")]
        probe: bool,
        /// Make sure the artifact is cached (the default without `--output`).
        #[arg(long)]
        prepare: bool,
        #[command(flatten)]
        tags: TagArgs,
    },
    /// Remove artifacts past the retention window.
    Sweep {
        /// Report what would be removed without removing anything.
        #[arg(long)]
        dry_run: bool,
        /// Also remove stored artifacts the catalog no longer knows about.
        #[arg(long)]
        orphans: bool,
    },
    /// Run the retention sweeper until interrupted.
    Daemon,
    /// List the configured formats.
    Formats {
        /// Include formats that aren't available on this system.
        #[arg(long)]
        all: bool,
    },
    /// Remove every artifact of a master that no longer exists.
    Forget { master: String },
}

#[derive(clap::Args, Debug)]
struct TagArgs {
    /// Defaults to the master's file name.
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    album: Option<String>,
    #[arg(long, default_value = "")]
    artist: String,
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    track: Option<u32>,
    /// Generated silence length, for the test track.
    #[arg(long, default_value_t = 30)]
    seconds: u32,
    /// Mark the artifact publicly cacheable.
    #[arg(long)]
    published: bool,
}

impl TagArgs {
    fn master(self, id: String) -> Master {
        let title = self.title.unwrap_or_else(|| {
            Path::new(&id).file_stem().map_or_else(|| id.clone(), |stem| stem.to_string_lossy().into_owned())
        });
        let tags = TrackTags {
            title,
            album: self.album,
            artist: self.artist,
            year: self.year,
            track: self.track,
            published: self.published,
            ..TrackTags::default()
        };
        if id == TEST_TRACK { Master::silence(id, self.seconds, tags) } else { Master::blob(id, tags) }
    }
}

/// Everything a command needs, opened from configuration.
struct App {
    config: Config,
    db: Database,
    catalog: Catalog,
    formats: Arc<Formats>,
}

impl App {
    async fn open(config: Config, dry_run: bool) -> Result<Self> {
        let mut storage = backend(&config.storage)?;
        if dry_run {
            storage = Arc::new(ReadOnlyBackend::new(storage));
        }
        let db = Database::connect(&config.database.path).await.or_raise(|| ErrorKind::Catalog)?;
        let catalog = Catalog::new(Repository::new(db.pool().clone(), dry_run), storage);
        let formats = match &config.formats.path {
            Some(path) => Formats::load(path),
            None => Formats::builtin(),
        }
        .or_raise(|| ErrorKind::Formats)?;
        Ok(Self { config, db, catalog, formats: Arc::new(formats) })
    }

    fn transcoder(&self) -> Transcoder {
        let transcode = &self.config.transcode;
        let defaults = Settings::default();
        let settings = Settings {
            ffmpeg: transcode.ffmpeg.clone(),
            magick: transcode.magick.clone(),
            work_dir: transcode.work_dir.clone(),
            blob_prefix: transcode.blob_prefix.clone(),
            timeout: transcode.timeout(),
            wait_timeout: transcode.wait_timeout(),
            max_concurrent: transcode.max_concurrent.unwrap_or(defaults.max_concurrent),
            allow_encumbered: self.config.formats.allow_encumbered,
            comment: transcode.comment.clone().unwrap_or(defaults.comment),
        };
        Transcoder::new(self.catalog.clone(), Arc::clone(&self.formats), settings)
    }

    fn sweeper(&self) -> RetentionSweeper {
        let retention = &self.config.retention;
        let mut policy = RetentionPolicy::new(retention.max_age()).with_pinned(retention.pinned.iter().cloned());
        if let Some(interval) = retention.interval() {
            policy = policy.with_interval(interval);
        }
        RetentionSweeper::new(self.catalog.clone(), policy, &self.config.transcode.blob_prefix)
    }
}

fn backend(config: &StorageConfig) -> Result<BackendHandle> {
    match config {
        StorageConfig::Local { root } => {
            Ok(Arc::new(LocalBackend::new("local", root).or_raise(|| ErrorKind::Storage)?))
        },
        #[cfg(feature = "s3")]
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let s3 = encore_storage::backend::S3Backend::new(
                "s3",
                bucket,
                prefix.clone(),
                region,
                endpoint.as_deref(),
                key_id,
                key_secret,
            )
            .or_raise(|| ErrorKind::Storage)?;
            Ok(Arc::new(s3))
        },
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => exn::bail!(ErrorKind::Usage("built without S3 support".into())),
    }
}

async fn transcode(app: &App, request: Request, output: Option<PathBuf>) -> Result<()> {
    let transcoder = app.transcoder();
    let to_stdout = output.as_deref() == Some(Path::new("-"));
    let production = transcoder.obtain_or_produce(request).await.or_raise(|| ErrorKind::Transcode)?;
    tracing::info!(status = %production.status, filename = %production.filename, "Transcode finished");
    match (&production.artifact, production.status) {
        // Direct productions were written to the output as they ran.
        (_, Status::Direct | Status::DirectWillCache | Status::Unavailable) => {},
        (Some(artifact), _) if output.is_some() => {
            let mut reader = app.catalog.backend().stream(&artifact.blob_path).await.or_raise(|| ErrorKind::Output)?;
            let mut writer = open_output(output.as_deref()).await?;
            tokio::io::copy(&mut reader, &mut writer).await.or_raise(|| ErrorKind::Output)?;
            tokio::io::AsyncWriteExt::shutdown(&mut writer).await.or_raise(|| ErrorKind::Output)?;
        },
        _ => {},
    }
    if !to_stdout {
        let location = production.artifact.as_ref().map(|a| a.blob_path.display().to_string());
        println!("{}\t{}", production.status, location.unwrap_or_default());
    }
    Ok(())
}

async fn open_output(output: Option<&Path>) -> Result<std::pin::Pin<Box<dyn AsyncWrite + Send>>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::pin(tokio::io::stdout())),
        Some(path) => Ok(Box::pin(tokio::fs::File::create(path).await.or_raise(|| ErrorKind::Output)?)),
        None => exn::bail!(ErrorKind::Usage("no output given".into())),
    }
}

async fn daemon(app: &App) {
    let sweeper = app.sweeper();
    let (shutdown, signal) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for interrupt");
        }
        tracing::info!("Shutting down");
        let _ = shutdown.send(true);
    });
    sweeper.run(signal).await;
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let dry_run = matches!(cli.command, Command::Sweep { dry_run: true, .. });
    let app = App::open(config, dry_run).await?;

    match cli.command {
        Command::Transcode { master, format, output, probe, prepare: _, tags } => {
            let delivery = match &output {
                _ if probe => Delivery::Probe,
                Some(_) => {
                    // Direct formats stream straight into the output; the rest
                    // are copied out of the cache afterwards.
                    match app.formats.by_name(&format) {
                        Some(f) if f.direct => Delivery::Stream(open_output(output.as_deref()).await?),
                        _ => Delivery::Prepare,
                    }
                },
                None => Delivery::Prepare,
            };
            let request = Request { master: tags.master(master), format, delivery };
            transcode(&app, request, output).await?;
        },
        Command::Sweep { dry_run, orphans } => {
            let sweeper = app.sweeper();
            let report = sweeper.sweep().await.or_raise(|| ErrorKind::Sweep)?;
            let prefix = if dry_run { "Would remove" } else { "Removed" };
            println!("{prefix} {} of {} expired artifact(s); {} failed", report.removed, report.expired, report.failed);
            if orphans && !dry_run {
                let removed = sweeper.sweep_orphans().await.or_raise(|| ErrorKind::Sweep)?;
                println!("Removed {removed} orphaned blob(s)");
            }
        },
        Command::Daemon => daemon(&app).await,
        Command::Formats { all } => {
            let allow = app.config.formats.allow_encumbered;
            for format in app.formats.iter().filter(|f| all || f.available(allow)) {
                println!(
                    "{:<16} {:<10} {:<10} .{:<5} {}",
                    format.name,
                    format.public_name(),
                    format.usage,
                    format.extension,
                    format.display_name
                );
            }
        },
        Command::Forget { master } => {
            let removed = app.transcoder().forget_master(&master).await.or_raise(|| ErrorKind::Transcode)?;
            println!("Removed {removed} artifact(s)");
        },
    }
    app.db.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "encore failed");
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_probe_conflicts_with_output() {
        let parsed = Cli::try_parse_from(["encore", "transcode", "m.flac", "FLAC", "--probe", "--output", "-"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_test_track_is_silence() {
        let cli = Cli::try_parse_from(["encore", "transcode", TEST_TRACK, "OPUS@stream", "--seconds", "5"]).unwrap();
        let Command::Transcode { master, tags, .. } = cli.command else {
            panic!("expected transcode");
        };
        let master = tags.master(master);
        assert_eq!(master.origin, encore_transcode::Origin::Silence { seconds: 5 });
        assert_eq!(master.tags.title, TEST_TRACK);
    }

    #[test]
    fn test_title_defaults_to_file_stem() {
        let cli = Cli::try_parse_from(["encore", "transcode", "masters/ab/Intro.flac", "FLAC"]).unwrap();
        let Command::Transcode { master, tags, .. } = cli.command else {
            panic!("expected transcode");
        };
        assert_eq!(tags.master(master).tags.title, "Intro");
    }
}
