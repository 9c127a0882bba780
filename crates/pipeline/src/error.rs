//! Pipeline Error Types

use crate::runner::StageFailure;
use derive_more::{Display, Error};
use std::time::Duration;

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("pipeline has no stages")]
    NoStages,
    #[display("cannot start {_0}")]
    Spawn(#[error(not(source))] String),
    #[display("cannot connect {_0} to the previous stage")]
    Stdio(#[error(not(source))] String),
    /// Reading the source or writing it into the first stage failed.
    #[display("cannot feed source into the pipeline")]
    Feed,
    /// Writing the final output to its destination failed.
    #[display("cannot deliver pipeline output")]
    Sink,
    #[display("cannot wait for {_0}")]
    Wait(#[error(not(source))] String),
    /// An encoder stage exited unsuccessfully.
    #[display("{_0}")]
    StageFailed(#[error(not(source))] StageFailure),
    #[display("pipeline did not finish within {}s", _0.as_secs())]
    TimedOut(#[error(not(source))] Duration),
    #[display("cannot write metadata file")]
    Metadata,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Feed | Self::TimedOut(_))
    }

    /// The failing stage's captured diagnostic output, if a stage failed.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::StageFailed(failure) => Some(&failure.diagnostics),
            _ => None,
        }
    }
}
