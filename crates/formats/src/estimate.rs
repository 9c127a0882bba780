use encore_pipeline::{CHANNELS, SAMPLE_RATE};
use serde::Deserialize;

/// What an output size estimate is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackData {
    /// Track length in samples at [`SAMPLE_RATE`].
    pub duration_samples: u64,
    /// Size of the master in bytes.
    pub master_size: u64,
}
impl TrackData {
    pub fn duration_secs(&self) -> f64 {
        self.duration_samples as f64 / f64::from(SAMPLE_RATE)
    }
}

/// Rough output size of a format, shown before anything is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizeEstimate {
    /// Constant (or average) bitrate encodes.
    Bitrate { kbps: f64 },
    /// Lossless encodes land near the master's own size.
    MasterRatio { ratio: f64 },
    /// Uncompressed PCM in a RIFF container.
    Pcm { bytes_per_sample: u32 },
}

const RIFF_HEADER: f64 = 44.0;

impl SizeEstimate {
    pub fn estimate(&self, track: &TrackData) -> u64 {
        let bytes = match *self {
            Self::Bitrate { kbps } => track.duration_secs() * kbps * 1000.0 / 8.0,
            Self::MasterRatio { ratio } => track.master_size as f64 * ratio,
            Self::Pcm { bytes_per_sample } => {
                let frame = f64::from(bytes_per_sample) * f64::from(CHANNELS);
                track.duration_samples as f64 * frame + RIFF_HEADER
            },
        };
        bytes.max(0.0).round() as u64
    }
}
