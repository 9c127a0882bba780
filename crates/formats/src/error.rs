//! Format catalog Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A format catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for format catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The definitions file could not be read or parsed.
    #[display("cannot load format definitions from {}", _0.display())]
    Load(#[error(not(source))] PathBuf),
    #[display("cannot parse built-in format definitions")]
    Builtin,
    #[display("duplicate format name: {_0}")]
    Duplicate(#[error(not(source))] String),
    #[display("format {_0} has a shortcut from unknown format {_1}")]
    UnknownShortcut(#[error(not(source))] String, #[error(not(source))] String),
    #[display("format {_0} lists itself as a shortcut source")]
    SelfShortcut(#[error(not(source))] String),
    #[display("format {_0} refers to unknown replaygain preset {_1}")]
    UnknownPreset(#[error(not(source))] String, #[error(not(source))] String),
    #[display("format {_0} is invalid: {_1}")]
    Invalid(#[error(not(source))] String, #[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
