//! Transcode Error Types

use derive_more::{Display, Error};
use encore_cache::CacheKey;

/// A transcode error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transcode operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("unknown format {_0}")]
    UnknownFormat(#[error(not(source))] String),
    #[display("format {_0} is not available here")]
    FormatUnavailable(#[error(not(source))] String),
    /// The master or its art could not be read from storage.
    #[display("source {_0} is missing")]
    SourceMissing(#[error(not(source))] String),
    /// A catalog row pointed at a blob that has since vanished.
    #[display("artifact {_0} is stale")]
    StaleArtifact(#[error(not(source))] CacheKey),
    /// An encoder stage failed; carries its diagnostic output.
    #[display("encoder failed: {_0}")]
    PipelineFailure(#[error(not(source))] String),
    #[display("production of {_0} failed")]
    ProductionFailed(#[error(not(source))] CacheKey),
    /// Gave up waiting for another caller's production of the same key.
    #[display("timed out waiting for in-flight production of {_0}")]
    ProductionRaceTimeout(#[error(not(source))] CacheKey),
    #[display("artifact catalog error")]
    Catalog,
    #[display("blob storage error")]
    Storage,
    #[display("cannot prepare working files")]
    WorkDir,
    #[display("transcoder is shutting down")]
    ShuttingDown,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProductionRaceTimeout(_) | Self::Catalog | Self::Storage | Self::StaleArtifact(_))
    }
}
