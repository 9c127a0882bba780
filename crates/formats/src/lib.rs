//! Target format catalog.
//!
//! A [`Format`] describes one encoding a master can be turned into: the
//! encoder arguments, whether it is cached or streamed live, which other
//! formats it can be cheaply derived from, and how loudness measurements
//! become tags. [`Formats`] is the validated, read-only table of them.

mod catalog;
pub mod error;
mod estimate;
mod format;
mod replaygain;

pub use crate::catalog::Formats;
pub use crate::estimate::{SizeEstimate, TrackData};
pub use crate::format::{AltCommand, Format, Shortcut, Usage};
pub use crate::replaygain::{ReplayGainData, ReplayGainFormula, Scope};
