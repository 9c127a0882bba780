use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("failed to open storage")]
    Storage,
    #[display("failed to open artifact catalog")]
    Catalog,
    #[display("failed to load formats")]
    Formats,
    #[display("transcode failed")]
    Transcode,
    #[display("retention sweep failed")]
    Sweep,
    #[display("failed to write output")]
    Output,
    #[display("{_0}")]
    Usage(#[error(not(source))] String),
}
