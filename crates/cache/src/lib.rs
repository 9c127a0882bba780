//! SQLite artifact catalog.
//!
//! Maps a `(master, format)` cache key to the blob holding the produced
//! artifact, with creation and last-access timestamps for retention. The
//! catalog is not the source of truth for whether an artifact exists, the
//! blob store is: rows pointing at vanished blobs are deleted on lookup.
//!
//! # Architecture
//! - [`Database`]: connection pool and embedded migrations.
//! - [`Repository`]: plain SQL operations over the `artifacts` table.
//! - [`Catalog`]: repository plus blob store, performing the self-healing
//!   lookup that also considers shortcut source formats.

mod catalog;
mod db;
pub mod error;
mod models;
mod repo;

pub use crate::catalog::{Catalog, Lookup};
pub use crate::db::Database;
pub use crate::models::{Artifact, CacheKey};
pub use crate::repo::Repository;
