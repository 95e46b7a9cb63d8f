//! SQLite backend for the lineage aggregate store.
//!
//! All access goes through one [`rusqlite::Connection`] behind a mutex. A
//! write transaction holds the mutex from `BEGIN IMMEDIATE` until it commits
//! or is dropped, so writers are serialised and never interleave.

mod encode;
mod query;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{SqliteStore, SqliteTx};

#[cfg(test)]
mod tests;
