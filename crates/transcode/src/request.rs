use derive_more::Display;
use encore_cache::Artifact;
use encore_formats::ReplayGainData;
use encore_pipeline::BoxAsyncWrite;
use std::path::PathBuf;

/// Tags written into every produced file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    /// `None` when the master is a whole release rendered as one file.
    pub album: Option<String>,
    pub artist: String,
    pub year: Option<i32>,
    pub track: Option<u32>,
    pub lyrics: Option<String>,
    pub replaygain: ReplayGainData,
    /// Published artifacts may be cached publicly and forever.
    pub published: bool,
}

/// Where a master's audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A blob in storage, at the master's id.
    Blob,
    /// Generated silence, for built-in placeholder tracks.
    Silence { seconds: u32 },
}

/// The never-transcoded source of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Master {
    /// Opaque identity; the storage path for blob masters.
    pub id: String,
    pub origin: Origin,
    pub tags: TrackTags,
    /// Cover art blob.
    pub art: Option<PathBuf>,
}

impl Master {
    pub fn blob(path: impl Into<String>, tags: TrackTags) -> Self {
        Self { id: path.into(), origin: Origin::Blob, tags, art: None }
    }

    pub fn silence(id: impl Into<String>, seconds: u32, tags: TrackTags) -> Self {
        Self { id: id.into(), origin: Origin::Silence { seconds }, tags, art: None }
    }

    pub fn with_art(mut self, art: impl Into<PathBuf>) -> Self {
        self.art = Some(art.into());
        self
    }
}

/// What the caller intends to do with the result.
pub enum Delivery {
    /// Only report whether the artifact is already cached. Never produces,
    /// and doesn't count as a use for retention.
    Probe,
    /// Make sure the artifact is cached, without receiving its bytes.
    Prepare,
    /// Receive the bytes. Only direct formats are written to this writer as
    /// they are produced; other formats are cached first and the caller
    /// reads the resulting artifact.
    Stream(BoxAsyncWrite),
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::Prepare => f.write_str("Prepare"),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub master: Master,
    /// Format name.
    pub format: String,
    pub delivery: Delivery,
}

/// How the bytes of a production were, or will be, obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Status {
    #[display("CACHED")]
    Cached,
    #[display("SHORTCUT")]
    Shortcut,
    #[display("FRESH")]
    Fresh,
    #[display("DIRECT")]
    Direct,
    #[display("DIRECT,WILL-CACHE")]
    DirectWillCache,
    #[display("UNAVAILABLE")]
    Unavailable,
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Production {
    pub status: Status,
    /// The cached artifact, when there is one.
    pub artifact: Option<Artifact>,
    /// Suggested download filename.
    pub filename: String,
}

impl Production {
    pub(crate) fn new(status: Status, artifact: Option<Artifact>, filename: String) -> Self {
        Self { status, artifact, filename }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Status::Cached, "CACHED")]
    #[case(Status::Shortcut, "SHORTCUT")]
    #[case(Status::Fresh, "FRESH")]
    #[case(Status::Direct, "DIRECT")]
    #[case(Status::DirectWillCache, "DIRECT,WILL-CACHE")]
    #[case(Status::Unavailable, "UNAVAILABLE")]
    fn test_status_display(#[case] status: Status, #[case] expected: &str) {
        assert_eq!(status.to_string(), expected);
    }
}
