//! Layered configuration.
//!
//! Values are resolved in order, later layers winning:
//!
//! 1. compiled defaults, with paths under the platform's project directories,
//! 2. an optional configuration file (TOML, YAML or JSON, by extension),
//! 3. `ENCORE_`-prefixed environment variables, with `__` between nested
//!    keys (`ENCORE_RETENTION__MAX_AGE_SECS=3600`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "ENCORE_";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub transcode: TranscodeConfig,
    pub retention: RetentionConfig,
    pub formats: FormatsConfig,
}

/// Where masters and artifacts are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local { root: data_dir().join("blobs") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding the artifact catalog.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: data_dir().join("catalog.sqlite") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub ffmpeg: String,
    pub magick: String,
    /// Scratch space for in-progress productions.
    pub work_dir: PathBuf,
    /// Storage prefix artifacts are uploaded under.
    pub blob_prefix: PathBuf,
    pub timeout_secs: Option<u64>,
    /// How long a request waits on someone else's production of the same
    /// artifact before giving up.
    pub wait_timeout_secs: Option<u64>,
    /// Limit on concurrent background productions; defaults to the number of
    /// CPUs.
    pub max_concurrent: Option<usize>,
    /// Comment tag written into every artifact.
    pub comment: Option<String>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            magick: "magick".to_string(),
            work_dir: cache_dir().join("work"),
            blob_prefix: PathBuf::from("transcodes"),
            timeout_secs: None,
            wait_timeout_secs: None,
            max_concurrent: None,
            comment: None,
        }
    }
}

impl TranscodeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Artifacts unused for this long are swept.
    pub max_age_secs: u64,
    pub interval_secs: Option<u64>,
    /// Masters whose artifacts are never swept.
    pub pinned: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_age_secs: 30 * 24 * 60 * 60, interval_secs: None, pinned: vec!["__testtrack".to_string()] }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatsConfig {
    /// Definitions file replacing the built-in format table.
    pub path: Option<PathBuf>,
    /// Offer formats whose encoders carry licensing restrictions.
    pub allow_encumbered: bool,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "encore")
}

fn data_dir() -> PathBuf {
    project_dirs().map_or_else(|| PathBuf::from("encore"), |dirs| dirs.data_dir().to_path_buf())
}

fn cache_dir() -> PathBuf {
    project_dirs().map_or_else(|| std::env::temp_dir().join("encore"), |dirs| dirs.cache_dir().to_path_buf())
}

impl Config {
    /// The default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// All layers, unextracted.
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => figment = merge_file(figment, path),
            None => {
                if let Some(path) = Self::default_path().filter(|p| p.is_file()) {
                    figment = merge_file(figment, &path);
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Resolve and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(database = %config.database.path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.max_age_secs == 0 {
            exn::bail!(ErrorKind::Invalid("retention.max_age_secs must be greater than zero".into()));
        }
        if self.retention.interval_secs == Some(0) {
            exn::bail!(ErrorKind::Invalid("retention.interval_secs must be greater than zero".into()));
        }
        if self.transcode.max_concurrent == Some(0) {
            exn::bail!(ErrorKind::Invalid("transcode.max_concurrent must be greater than zero".into()));
        }
        for (key, program) in [("transcode.ffmpeg", &self.transcode.ffmpeg), ("transcode.magick", &self.transcode.magick)] {
            if program.trim().is_empty() {
                exn::bail!(ErrorKind::Invalid(format!("{key} must not be empty")));
            }
        }
        match &self.storage {
            StorageConfig::Local { root } if root.is_relative() => {
                exn::bail!(ErrorKind::Invalid(format!("storage.root must be absolute, got {}", root.display())));
            },
            StorageConfig::S3 { bucket, .. } if bucket.is_empty() => {
                exn::bail!(ErrorKind::Invalid("storage.bucket must not be empty".into()));
            },
            _ => {},
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => figment.merge(Toml::file_exact(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    fn valid() -> Config {
        Config { storage: StorageConfig::Local { root: PathBuf::from("/srv/encore") }, ..Config::default() }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transcode.ffmpeg, "ffmpeg");
        assert_eq!(config.transcode.blob_prefix, Path::new("transcodes"));
        assert_eq!(config.retention.pinned, vec!["__testtrack".to_string()]);
        assert!(!config.formats.allow_encumbered);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "encore.toml",
                r#"
                [storage]
                kind = "local"
                root = "/srv/encore"

                [retention]
                max_age_secs = 3600

                [transcode]
                ffmpeg = "/opt/ffmpeg/bin/ffmpeg"
                "#,
            )?;
            jail.set_env("ENCORE_RETENTION__MAX_AGE_SECS", "60");
            jail.set_env("ENCORE_FORMATS__ALLOW_ENCUMBERED", "true");
            let config = Config::load(Some(Path::new("encore.toml"))).unwrap();
            assert_eq!(config.storage, StorageConfig::Local { root: PathBuf::from("/srv/encore") });
            assert_eq!(config.retention.max_age(), Duration::from_secs(60));
            assert_eq!(config.transcode.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
            assert_eq!(config.transcode.magick, "magick");
            assert!(config.formats.allow_encumbered);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_s3() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "encore.yaml",
                "storage:\n  kind: s3\n  bucket: music\n  region: us-west-004\n  key_id: id\n  key_secret: secret\n",
            )?;
            let config = Config::load(Some(Path::new("encore.yaml"))).unwrap();
            let StorageConfig::S3 { bucket, prefix, endpoint, .. } = config.storage else {
                panic!("expected s3 storage");
            };
            assert_eq!(bucket, "music");
            assert_eq!(prefix, None);
            assert_eq!(endpoint, None);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/nonexistent/encore.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[rstest]
    #[case::zero_window(|c: &mut Config| c.retention.max_age_secs = 0)]
    #[case::zero_interval(|c: &mut Config| c.retention.interval_secs = Some(0))]
    #[case::zero_concurrency(|c: &mut Config| c.transcode.max_concurrent = Some(0))]
    #[case::empty_ffmpeg(|c: &mut Config| c.transcode.ffmpeg = " ".into())]
    #[case::relative_root(|c: &mut Config| c.storage = StorageConfig::Local { root: "blobs".into() })]
    fn test_validate_rejects(#[case] mutate: fn(&mut Config)) {
        let mut config = valid();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }
}
