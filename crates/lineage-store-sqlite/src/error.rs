//! Error type for `lineage-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored enum or version column held a value this build cannot read.
  #[error("cannot decode {column}: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("entity not found: {0}")]
  EntityNotFound(uuid::Uuid),

  #[error("snapshot not found: {0}")]
  SnapshotNotFound(uuid::Uuid),

  #[error("batch for {batch} cannot write to {target}")]
  ForeignWrite {
    batch:  uuid::Uuid,
    target: uuid::Uuid,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
