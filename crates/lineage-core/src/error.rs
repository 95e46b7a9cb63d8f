//! Error types for `lineage-core`.
//!
//! Every variant carries the identifiers a presentation layer needs to render
//! a precise message (uid, field, expected vs. actual state) without knowing
//! anything about the store's internals.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
  guard::LockToken,
  version::{Status, Transition, Version},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error(
    "entity {uid} has no version matching {}",
    describe_lookup(.version, .status, .at_date)
  )]
  NotFound {
    uid:     Uuid,
    version: Option<Version>,
    status:  Option<Status>,
    at_date: Option<DateTime<Utc>>,
  },

  #[error("selection {selection_uid} not found under {parent_uid}")]
  SelectionNotFound { parent_uid: Uuid, selection_uid: Uuid },

  #[error("{field} {value:?} is already used by {existing}")]
  Duplicate {
    field:    &'static str,
    value:    String,
    existing: Uuid,
  },

  #[error(transparent)]
  StateViolation(#[from] StateViolation),

  #[error("aggregate {uid} was modified concurrently; re-read and retry")]
  Conflict {
    uid:      Uuid,
    expected: Option<LockToken>,
    actual:   Option<LockToken>,
  },

  #[error("invalid {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// An operation that the lifecycle or a business rule forbids in the
/// aggregate's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateViolation {
  #[error(
    "cannot {transition} {uid}: status is {actual}, expected {}",
    join_statuses(.expected)
  )]
  IllegalTransition {
    uid:        Uuid,
    transition: Transition,
    actual:     Status,
    expected:   &'static [Status],
  },

  #[error(
    "aggregate {parent_uid} is frozen: its selections cannot be added, \
     removed, edited or reordered"
  )]
  Frozen { parent_uid: Uuid },

  #[error("cannot delete {uid}: version {version} was approved")]
  DeleteAfterApproval { uid: Uuid, version: Version },

  #[error("cannot delete {uid}: referenced by {count} selection(s)")]
  InboundReferences { uid: Uuid, count: usize },

  #[error("entity {uid} is deleted")]
  Deleted { uid: Uuid },

  #[error("aggregate {uid} was not read for update")]
  NotReadForUpdate { uid: Uuid },
}

/// The coarse error classes a caller maps onto user-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  NotFound,
  Duplicate,
  StateViolation,
  Validation,
  Storage,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::NotFound { .. } | Self::SelectionNotFound { .. } => {
        ErrorKind::NotFound
      }
      Self::Duplicate { .. } => ErrorKind::Duplicate,
      Self::StateViolation(_) | Self::Conflict { .. } => {
        ErrorKind::StateViolation
      }
      Self::Validation { .. } => ErrorKind::Validation,
      Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
    }
  }

  /// True when the write lost an optimistic-lock race. Retrying is the
  /// caller's decision.
  pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict { .. }) }

  pub fn storage(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Storage(Box::new(e))
  }

  pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Validation {
      field:  field.into(),
      reason: reason.into(),
    }
  }
}

fn describe_lookup(
  version: &Option<Version>,
  status: &Option<Status>,
  at_date: &Option<DateTime<Utc>>,
) -> String {
  let mut parts = Vec::new();
  if let Some(v) = version {
    parts.push(format!("version {v}"));
  }
  if let Some(s) = status {
    parts.push(format!("status {s}"));
  }
  if let Some(at) = at_date {
    parts.push(format!("date {}", at.to_rfc3339()));
  }
  if parts.is_empty() {
    "the current version".to_owned()
  } else {
    parts.join(", ")
  }
}

fn join_statuses(statuses: &[Status]) -> String {
  statuses
    .iter()
    .map(|s| s.to_string())
    .collect::<Vec<_>>()
    .join(" or ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn conflict_is_a_state_violation() {
    let err = Error::Conflict {
      uid:      Uuid::nil(),
      expected: None,
      actual:   None,
    };
    assert_eq!(err.kind(), ErrorKind::StateViolation);
    assert!(err.is_conflict());
  }

  #[test]
  fn not_found_message_names_the_filters() {
    let err = Error::NotFound {
      uid:     Uuid::nil(),
      version: Some(Version::new(1, 2)),
      status:  Some(Status::Final),
      at_date: None,
    };
    let msg = err.to_string();
    assert!(msg.contains("version 1.2"), "{msg}");
    assert!(msg.contains("status final"), "{msg}");
  }

  #[test]
  fn illegal_transition_lists_expected_states() {
    let err: Error = StateViolation::IllegalTransition {
      uid:        Uuid::nil(),
      transition: Transition::NewVersion,
      actual:     Status::Draft,
      expected:   &[Status::Final, Status::Retired],
    }
    .into();
    assert!(err.to_string().ends_with("expected final or retired"));
  }
}
