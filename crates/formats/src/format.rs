use crate::estimate::{SizeEstimate, TrackData};
use crate::replaygain::{ReplayGainData, ReplayGainFormula};
use derive_more::Display;
use encore_pipeline::Stage;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Who a format is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Usage {
    /// User-facing downloads: full metadata and embedded art.
    #[display("download")]
    Download,
    /// In-browser playback.
    #[display("stream")]
    Stream,
    /// In-browser playback on poor connections.
    #[display("stream_low")]
    StreamLow,
}
impl Usage {
    pub fn can_download(&self) -> bool {
        matches!(self, Self::Download)
    }

    pub fn can_stream(&self) -> bool {
        matches!(self, Self::Stream | Self::StreamLow)
    }
}

/// A cheap way to produce a format from another format's cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Shortcut {
    /// Name of the format whose artifact is used as input.
    pub source: String,
    /// Encoder arguments replacing the format's own.
    pub args: Vec<String>,
}

/// An encoder stage for codecs the primary encoder doesn't have.
///
/// It reads WAV on standard input and writes its encode to standard output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AltCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}
impl AltCommand {
    pub fn stage(&self) -> Stage {
        Stage::new(&self.program, self.args.iter().cloned())
    }

    /// Whether the program can be found on `PATH`.
    pub fn discover(&self) -> bool {
        match which::which(&self.program) {
            Ok(path) => {
                tracing::trace!(program = %self.program, path = %path.display(), "Discovered alternate encoder");
                true
            },
            Err(_) => false,
        }
    }
}

/// A target encoding.
#[derive(Debug, Clone, PartialEq, Display)]
#[display("{name}")]
pub struct Format {
    /// Stable identity, used as half of a cache key. May carry a private
    /// `@suffix` distinguishing variants that share a public name.
    pub name: String,
    pub display_name: String,
    pub subtitle: Option<String>,
    pub usage: Usage,
    pub extension: String,
    pub mime_type: String,
    /// Encoder arguments selecting codec, container and quality.
    pub args: Vec<String>,
    pub alt_command: Option<AltCommand>,
    /// Streamed live to the caller as it is produced.
    pub direct: bool,
    /// Persisted to the blob store and catalog.
    pub cache: bool,
    pub lossless: bool,
    pub uncompressed: bool,
    pub requires_encumbered: bool,
    pub size_estimate: SizeEstimate,
    pub replaygain: BTreeMap<String, ReplayGainFormula>,
    /// Tried in order; the first cached source wins.
    pub shortcuts: Vec<Shortcut>,
}
impl Format {
    /// The name without its private `@` suffix.
    pub fn public_name(&self) -> &str {
        match self.name.split_once('@') {
            Some((public, _)) => public,
            None => &self.name,
        }
    }

    pub fn shortcut_sources(&self) -> Vec<&str> {
        self.shortcuts.iter().map(|s| s.source.as_str()).collect()
    }

    pub fn shortcut_from(&self, source: &str) -> Option<&Shortcut> {
        self.shortcuts.iter().find(|s| s.source == source)
    }

    /// Whether the format can be offered at all on this system.
    pub fn available(&self, allow_encumbered: bool) -> bool {
        if self.requires_encumbered && !allow_encumbered {
            return false;
        }
        self.alt_command.as_ref().is_none_or(AltCommand::discover)
    }

    pub fn estimate_size(&self, duration_samples: u64, master_size: u64) -> u64 {
        self.size_estimate.estimate(&TrackData { duration_samples, master_size })
    }

    /// Tag lines to write for the given loudness measurements.
    pub fn replaygain_tags(&self, data: &ReplayGainData) -> Vec<(String, String)> {
        self.replaygain.iter().map(|(tag, formula)| (tag.clone(), formula.apply(data))).collect()
    }

    /// Whether the encoder arguments explicitly drop video (and so art).
    pub fn drops_video(&self) -> bool {
        self.args.iter().any(|arg| arg == "-vn")
    }

    /// Ogg-family containers carry art as a FLAC picture block tag rather
    /// than an attached picture stream.
    pub fn is_ogg(&self) -> bool {
        matches!(self.extension.as_str(), "ogg" | "oga" | "opus")
    }
}
