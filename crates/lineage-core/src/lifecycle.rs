//! The lifecycle state machine.
//!
//! ```text
//!            edit_draft
//!             ┌──────┐
//!             ▼      │
//! create ──▶ Draft ──┘ ──approve──▶ Final ◀──reactivate── Retired
//!             ▲                      │  └────inactivate─────▶ │
//!             └──create_new_version──┴────────────────────────┘
//! ```
//!
//! Each function takes the current head and returns the next version. None of
//! them touch storage; `start_date` on the returned version is provisional and
//! is re-stamped with the commit time when the aggregate is saved.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error, Result, StateViolation,
  entity::{NewEntity, VersionedEntity},
  version::{Transition, Version},
};

/// The first version of a new entity: Draft 0.1.
pub fn create(
  uid: Uuid,
  input: NewEntity,
  author: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  validate_name(&input.name)?;
  if input.kind.trim().is_empty() {
    return Err(Error::validation("kind", "must not be empty"));
  }
  Ok(VersionedEntity {
    uid,
    kind: input.kind,
    name: input.name,
    payload: input.payload,
    status: Transition::Create.target(),
    version: Version::initial(),
    transition: Transition::Create,
    start_date: at,
    end_date: None,
    author: author.to_owned(),
    change_description: Some("Initial version".to_owned()),
  })
}

/// Edit a Draft in place, producing the next minor version.
///
/// Returns `Ok(None)` when name and payload are value-equal to the current
/// ones; an idempotent edit changes neither version nor history.
pub fn edit_draft(
  current: &VersionedEntity,
  name: Option<String>,
  payload: serde_json::Value,
  author: &str,
  change_description: &str,
  at: DateTime<Utc>,
) -> Result<Option<VersionedEntity>> {
  require(current, Transition::EditDraft)?;
  let name = name.unwrap_or_else(|| current.name.clone());
  validate_name(&name)?;
  if name == current.name && payload == current.payload {
    return Ok(None);
  }
  let mut next = successor(current, Transition::EditDraft, author, at)?;
  next.name = name;
  next.payload = payload;
  next.change_description = Some(change_description.to_owned());
  Ok(Some(next))
}

/// Draft → Final, bumping the major version.
pub fn approve(
  current: &VersionedEntity,
  author: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  require(current, Transition::Approve)?;
  let mut next = successor(current, Transition::Approve, author, at)?;
  next.change_description = Some("Approved version".to_owned());
  Ok(next)
}

/// Final/Retired → Draft at the next minor version. The Final or Retired
/// version stays addressable by its own number.
pub fn create_new_version(
  current: &VersionedEntity,
  author: &str,
  change_description: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  require(current, Transition::NewVersion)?;
  let mut next = successor(current, Transition::NewVersion, author, at)?;
  next.change_description = Some(change_description.to_owned());
  Ok(next)
}

/// Final → Retired; the version number is kept.
pub fn inactivate(
  current: &VersionedEntity,
  author: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  require(current, Transition::Inactivate)?;
  let mut next = successor(current, Transition::Inactivate, author, at)?;
  next.change_description = Some("Inactivated version".to_owned());
  Ok(next)
}

/// Retired → Final; the version number is kept.
pub fn reactivate(
  current: &VersionedEntity,
  author: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  require(current, Transition::Reactivate)?;
  let mut next = successor(current, Transition::Reactivate, author, at)?;
  next.change_description = Some("Reactivated version".to_owned());
  Ok(next)
}

/// A soft delete is only allowed while no version was ever approved.
/// Inbound references are checked by the repository, inside the write
/// transaction.
pub fn check_delete<'a>(
  uid: Uuid,
  versions: impl IntoIterator<Item = &'a VersionedEntity>,
) -> Result<()> {
  match versions
    .into_iter()
    .find(|v| v.status == crate::version::Status::Final)
  {
    Some(approved) => Err(
      StateViolation::DeleteAfterApproval {
        uid,
        version: approved.version,
      }
      .into(),
    ),
    None => Ok(()),
  }
}

/// Check that `next` is a legal successor of `prev`, i.e. an edge of the state
/// diagram with the matching version arithmetic. `prev == None` only admits
/// a `Create`.
pub fn validate_successor(
  prev: Option<&VersionedEntity>,
  next: &VersionedEntity,
) -> Result<()> {
  let transition = next.transition;
  let expected_version = match prev {
    None if transition == Transition::Create => Version::initial(),
    None => {
      return Err(Error::validation(
        "transition",
        format!("{transition} requires an existing entity {}", next.uid),
      ));
    }
    Some(prev) => {
      if transition == Transition::Create {
        return Err(Error::Duplicate {
          field:    "uid",
          value:    next.uid.to_string(),
          existing: prev.uid,
        });
      }
      require(prev, transition)?;
      transition.next_version(prev.version)?
    }
  };
  if next.status != transition.target() || next.version != expected_version {
    return Err(Error::validation(
      "version",
      format!(
        "{transition} must produce {} {expected_version}, got {} {}",
        transition.target(),
        next.status,
        next.version
      ),
    ));
  }
  Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn require(current: &VersionedEntity, transition: Transition) -> Result<()> {
  let expected = transition.allowed_from();
  if expected.contains(&current.status) {
    Ok(())
  } else {
    Err(
      StateViolation::IllegalTransition {
        uid: current.uid,
        transition,
        actual: current.status,
        expected,
      }
      .into(),
    )
  }
}

fn successor(
  current: &VersionedEntity,
  transition: Transition,
  author: &str,
  at: DateTime<Utc>,
) -> Result<VersionedEntity> {
  Ok(VersionedEntity {
    uid: current.uid,
    kind: current.kind.clone(),
    name: current.name.clone(),
    payload: current.payload.clone(),
    status: transition.target(),
    version: transition.next_version(current.version)?,
    transition,
    start_date: at,
    end_date: None,
    author: author.to_owned(),
    change_description: None,
  })
}

fn validate_name(name: &str) -> Result<()> {
  if name.trim().is_empty() {
    return Err(Error::validation("name", "must not be empty"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::version::Status;

  fn draft() -> VersionedEntity {
    create(
      Uuid::new_v4(),
      NewEntity::new("unit", "mg", json!({ "factor": 1 })),
      "alice",
      Utc::now(),
    )
    .unwrap()
  }

  fn label(v: &VersionedEntity) -> String { format!("{}/{}", v.version, v.status) }

  #[test]
  fn scenario_a_version_sequence() {
    let now = Utc::now();
    let v0 = draft();
    let v1 = approve(&v0, "alice", now).unwrap();
    let v2 = inactivate(&v1, "alice", now).unwrap();
    let v3 = reactivate(&v2, "alice", now).unwrap();
    let v4 = create_new_version(&v3, "alice", "next", now).unwrap();

    let labels: Vec<_> = [&v0, &v1, &v2, &v3, &v4].into_iter().map(label).collect();
    assert_eq!(labels, [
      "0.1/draft",
      "1.0/final",
      "1.0/retired",
      "1.0/final",
      "1.1/draft"
    ]);

    let mut prev = None;
    for v in [&v0, &v1, &v2, &v3, &v4] {
      validate_successor(prev, v).unwrap();
      prev = Some(v);
    }
  }

  #[test]
  fn edit_draft_bumps_minor_and_is_idempotent() {
    let v0 = draft();
    let v1 = edit_draft(&v0, None, json!({ "factor": 2 }), "bob", "fix", Utc::now())
      .unwrap()
      .unwrap();
    assert_eq!(v1.version, Version::new(0, 2));
    assert_eq!(v1.status, Status::Draft);
    assert_eq!(v1.author, "bob");

    let same = edit_draft(&v1, None, json!({ "factor": 2 }), "bob", "again", Utc::now())
      .unwrap();
    assert!(same.is_none());
  }

  #[test]
  fn illegal_transitions_are_state_violations() {
    let now = Utc::now();
    let v0 = draft();
    assert!(matches!(
      inactivate(&v0, "a", now),
      Err(Error::StateViolation(StateViolation::IllegalTransition { .. }))
    ));
    assert!(create_new_version(&v0, "a", "x", now).is_err());

    let fin = approve(&v0, "a", now).unwrap();
    assert!(edit_draft(&fin, None, json!({}), "a", "x", now).is_err());
    assert!(approve(&fin, "a", now).is_err());
    assert!(reactivate(&fin, "a", now).is_err());
  }

  #[test]
  fn delete_blocked_once_approved() {
    let v0 = draft();
    assert!(check_delete(v0.uid, [&v0]).is_ok());

    let v1 = approve(&v0, "a", Utc::now()).unwrap();
    let v2 = create_new_version(&v1, "a", "x", Utc::now()).unwrap();
    let err = check_delete(v0.uid, [&v0, &v1, &v2]).unwrap_err();
    assert!(matches!(
      err,
      Error::StateViolation(StateViolation::DeleteAfterApproval { .. })
    ));
  }

  #[test]
  fn exhausted_version_numbers_fail_validation() {
    let mut v0 = draft();
    v0.version = Version::new(u32::MAX, 4);
    assert!(matches!(
      approve(&v0, "alice", Utc::now()),
      Err(Error::Validation { .. })
    ));
    v0.version = Version::new(0, u32::MAX);
    assert!(matches!(
      edit_draft(&v0, None, json!({}), "alice", "x", Utc::now()),
      Err(Error::Validation { .. })
    ));
  }

  #[test]
  fn successor_rejects_forged_version_numbers() {
    let v0 = draft();
    let mut forged = approve(&v0, "a", Utc::now()).unwrap();
    forged.version = Version::new(7, 0);
    assert!(validate_successor(Some(&v0), &forged).is_err());
    assert!(validate_successor(None, &forged).is_err());
  }
}
