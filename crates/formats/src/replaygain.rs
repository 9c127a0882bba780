use serde::Deserialize;

/// Loudness measurements of a track and the release it belongs to.
///
/// Loudness is integrated loudness in LUFS, peaks are true peaks in dBTP.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReplayGainData {
    pub album_loudness: f64,
    pub track_loudness: f64,
    pub album_peak: f64,
    pub track_peak: f64,
}
impl ReplayGainData {
    fn loudness(&self, scope: Scope) -> f64 {
        match scope {
            Scope::Album => self.album_loudness,
            Scope::Track => self.track_loudness,
        }
    }

    fn peak(&self, scope: Scope) -> f64 {
        match scope {
            Scope::Album => self.album_peak,
            Scope::Track => self.track_peak,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Album,
    Track,
}

/// How one output tag is computed from [`ReplayGainData`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayGainFormula {
    /// ReplayGain 2.0 gain relative to a reference level, e.g. `-3.21 dB`.
    Gain {
        scope: Scope,
        #[serde(default = "default_gain_reference")]
        reference: f64,
        /// Decimal places.
        #[serde(default = "default_gain_precision")]
        precision: usize,
    },
    /// Linear sample peak, e.g. `0.988553`.
    Peak {
        scope: Scope,
        #[serde(default = "default_peak_precision")]
        precision: usize,
    },
    /// Opus R128 gain: Q7.8 fixed point relative to -23 LUFS.
    R128 {
        scope: Scope,
        #[serde(default = "default_r128_reference")]
        reference: f64,
    },
}

fn default_gain_reference() -> f64 {
    -18.0
}

fn default_gain_precision() -> usize {
    2
}

fn default_peak_precision() -> usize {
    6
}

fn default_r128_reference() -> f64 {
    -23.0
}

impl ReplayGainFormula {
    pub fn apply(&self, data: &ReplayGainData) -> String {
        match *self {
            Self::Gain { scope, reference, precision } => {
                format!("{:.precision$} dB", reference - data.loudness(scope))
            },
            Self::Peak { scope, precision } => format!("{:.precision$}", 10f64.powf(data.peak(scope) / 20.0)),
            Self::R128 { scope, reference } => {
                let q78 = ((reference - data.loudness(scope)) * 256.0).round();
                let clamped = q78.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
                clamped.to_string()
            },
        }
    }
}
