use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;
pub type BoxAsyncWrite = Pin<Box<dyn AsyncWrite + Send + 'static>>;

/// One external process in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}
impl Stage {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Bytes fed into the first stage.
pub enum Source {
    Reader(BoxAsyncRead),
    /// Raw s16le stereo PCM zeros at the system sample rate, for masters that
    /// are placeholders rather than real recordings.
    Silence { seconds: u32 },
}
impl Source {
    pub fn reader(reader: impl AsyncRead + Send + 'static) -> Self {
        Self::Reader(Box::pin(reader))
    }
}

/// Where the last stage's output goes.
pub enum Output {
    /// The last stage writes this file itself; its standard output is
    /// discarded. Needed for containers that seek back while muxing.
    File(PathBuf),
    /// Stream to a live consumer only.
    Stream(BoxAsyncWrite),
    /// Write to a cache file, and best-effort to a live consumer.
    Fork { cache: PathBuf, live: BoxAsyncWrite },
}
impl Output {
    /// The output argument the last stage must be given.
    pub fn target(&self) -> &OsStr {
        match self {
            Self::File(path) => path.as_os_str(),
            Self::Stream(_) | Self::Fork { .. } => OsStr::new("-"),
        }
    }

    /// The file an artifact will be left in, if any.
    pub fn cache_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) | Self::Fork { cache: path, .. } => Some(path),
            Self::Stream(_) => None,
        }
    }

    pub(crate) fn captures_stdout(&self) -> bool {
        !matches!(self, Self::File(_))
    }
}
