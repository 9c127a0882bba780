//! Deduplicated transcode production.
//!
//! The [`Transcoder`] answers "give me master M in format F": from the
//! catalog when possible, by a cheap remux of another cached format when one
//! is available, and otherwise by running the full encoder pipeline. At most
//! one production per `(master, format)` runs at a time; concurrent callers
//! for the same key wait for it and then find the result in the catalog.
//!
//! The [`RetentionSweeper`] removes artifacts nobody has asked for within the
//! retention window.

mod art;
pub mod error;
mod invocation;
mod mutex;
mod naming;
mod request;
mod retention;
mod transcoder;

pub use crate::mutex::{Claim, InFlight, Mutexes, Slot};
pub use crate::naming::{content_disposition, download_filename, encode_filename};
pub use crate::request::{Delivery, Master, Origin, Production, Request, Status, TrackTags};
pub use crate::retention::{RetentionPolicy, RetentionSweeper, SweepReport};
pub use crate::transcoder::{Settings, Transcoder};

/// Identity of the built-in silent test track, which is never swept.
pub const TEST_TRACK: &str = "__testtrack";
