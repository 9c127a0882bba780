//! External encoder pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s whose standard streams are
//! chained together: the [`Source`] is fed into the first stage, and the last
//! stage's output is delivered according to [`Output`], optionally split
//! between a cache file and a live consumer through a [`ForkingSink`].

pub mod error;
mod fork;
mod metadata;
mod picture;
mod runner;
mod stage;

pub use crate::fork::ForkingSink;
pub use crate::metadata::Metadata;
pub use crate::picture::picture_block;
pub use crate::runner::{Completion, Pipeline, StageFailure};
pub use crate::stage::{BoxAsyncRead, BoxAsyncWrite, Output, Source, Stage};

/// Sample rate of every PCM stream the system produces or measures.
pub const SAMPLE_RATE: u32 = 48_000;
/// Channel count of synthetic PCM (stereo).
pub const CHANNELS: u16 = 2;
/// Bytes per sample of synthetic PCM (signed 16-bit little-endian).
pub const BYTES_PER_SAMPLE: u16 = 2;
