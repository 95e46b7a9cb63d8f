//! Versioned entities: the immutable snapshots that make up an aggregate's
//! version chain.
//!
//! Each lifecycle step appends one [`VersionedEntity`]. The `[start_date,
//! end_date)` intervals of one uid's versions partition time: appending a
//! version closes the open interval of its predecessor at the new version's
//! `start_date`. Only `end_date` is ever written after a version is stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
  Result,
  version::{Status, Transition, Version},
};

// ─── VersionedEntity ─────────────────────────────────────────────────────────

/// One version of an aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
  /// Stable across all versions.
  pub uid:                Uuid,
  /// Uniqueness scope; `(kind, name)` is unique among live entities.
  pub kind:               String,
  pub name:               String,
  /// Domain fields. Opaque to the engine except for value equality.
  pub payload:            serde_json::Value,
  pub status:             Status,
  pub version:            Version,
  /// The lifecycle operation that produced this version.
  pub transition:         Transition,
  pub start_date:         DateTime<Utc>,
  /// `None` while this is the current version.
  pub end_date:           Option<DateTime<Utc>>,
  pub author:             String,
  pub change_description: Option<String>,
}

impl VersionedEntity {
  pub fn is_open(&self) -> bool { self.end_date.is_none() }

  /// Whether `at` falls inside `[start_date, end_date)`.
  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start_date <= at && self.end_date.is_none_or(|end| at < end)
  }

  /// Deserialise the payload into a typed domain value.
  pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.payload.clone())?)
  }
}

// ─── NewEntity ───────────────────────────────────────────────────────────────

/// Input to [`crate::Aggregate::create`].
#[derive(Debug, Clone)]
pub struct NewEntity {
  pub kind:    String,
  pub name:    String,
  pub payload: serde_json::Value,
}

impl NewEntity {
  pub fn new(
    kind: impl Into<String>,
    name: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      kind: kind.into(),
      name: name.into(),
      payload,
    }
  }

  /// Build from any serialisable domain value.
  pub fn from_value<T: Serialize>(
    kind: impl Into<String>,
    name: impl Into<String>,
    value: &T,
  ) -> Result<Self> {
    Ok(Self::new(kind, name, serde_json::to_value(value)?))
  }
}

// ─── EntityChain ─────────────────────────────────────────────────────────────

/// Every stored version of one uid, oldest first, plus the root-level flags
/// that are not versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChain {
  pub uid:        Uuid,
  pub kind:       String,
  pub versions:   Vec<VersionedEntity>,
  /// Business-level lock: selections may not be mutated while set.
  pub frozen:     bool,
  pub deleted_at: Option<DateTime<Utc>>,
}

impl EntityChain {
  pub fn is_deleted(&self) -> bool { self.deleted_at.is_some() }

  /// The open-interval version, if the entity is live.
  pub fn current(&self) -> Option<&VersionedEntity> {
    if self.is_deleted() {
      return None;
    }
    self.versions.iter().rev().find(|v| v.is_open())
  }

  /// The most recently appended version, deleted or not.
  pub fn latest(&self) -> Option<&VersionedEntity> { self.versions.last() }

  /// The most recent version of a live entity whose status is one of
  /// `accepted`. A Final 1.0 stays selectable while a Draft 1.1 is open.
  pub fn latest_with_status(&self, accepted: &[Status]) -> Option<&VersionedEntity> {
    if self.is_deleted() {
      return None;
    }
    self.versions.iter().rev().find(|v| accepted.contains(&v.status))
  }

  /// Whether any version in the chain was ever approved.
  pub fn ever_final(&self) -> bool {
    self.versions.iter().any(|v| v.status == Status::Final)
  }

  /// Select the unique version matching the given filters.
  ///
  /// - `version`: exact numeric match.
  /// - `at_date`: the version whose interval contains that instant.
  /// - `status`: alone, it selects the most recent version with that status;
  ///   combined with other filters it narrows them.
  /// - no filters: the current version.
  ///
  /// When several versions share a number (inactivate/reactivate keep it),
  /// the most recent one wins.
  pub fn select(
    &self,
    version: Option<Version>,
    status: Option<Status>,
    at_date: Option<DateTime<Utc>>,
  ) -> Option<&VersionedEntity> {
    if version.is_none() && at_date.is_none() && status.is_none() {
      return self.current();
    }
    self.versions.iter().rev().find(|v| {
      version.is_none_or(|x| v.version == x)
        && status.is_none_or(|s| v.status == s)
        && at_date.is_none_or(|at| v.contains(at))
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};

  use super::*;

  fn version(
    status: Status,
    v: Version,
    start: i64,
    end: Option<i64>,
  ) -> VersionedEntity {
    VersionedEntity {
      uid: Uuid::nil(),
      kind: "unit".into(),
      name: "mg".into(),
      payload: serde_json::json!({ "v": v.to_string() }),
      status,
      version: v,
      transition: Transition::EditDraft,
      start_date: Utc.timestamp_opt(start, 0).unwrap(),
      end_date: end.map(|e| Utc.timestamp_opt(e, 0).unwrap()),
      author: "tester".into(),
      change_description: None,
    }
  }

  fn chain() -> EntityChain {
    EntityChain {
      uid:        Uuid::nil(),
      kind:       "unit".into(),
      versions:   vec![
        version(Status::Draft, Version::new(0, 1), 0, Some(10)),
        version(Status::Final, Version::new(1, 0), 10, Some(20)),
        version(Status::Retired, Version::new(1, 0), 20, Some(30)),
        version(Status::Final, Version::new(1, 0), 30, Some(40)),
        version(Status::Draft, Version::new(1, 1), 40, None),
      ],
      frozen:     false,
      deleted_at: None,
    }
  }

  #[test]
  fn default_selection_is_open_version() {
    let c = chain();
    assert_eq!(c.select(None, None, None).unwrap().version, Version::new(1, 1));
  }

  #[test]
  fn shared_version_number_prefers_latest_unless_status_given() {
    let c = chain();
    let v = c.select(Some(Version::new(1, 0)), None, None).unwrap();
    assert_eq!(v.start_date, Utc.timestamp_opt(30, 0).unwrap());

    let retired = c
      .select(Some(Version::new(1, 0)), Some(Status::Retired), None)
      .unwrap();
    assert_eq!(retired.status, Status::Retired);
  }

  #[test]
  fn at_date_uses_half_open_interval() {
    let c = chain();
    let at = |s: i64| Some(Utc.timestamp_opt(s, 0).unwrap());
    assert_eq!(c.select(None, None, at(10)).unwrap().version, Version::new(1, 0));
    assert_eq!(c.select(None, None, at(9)).unwrap().version, Version::new(0, 1));
    assert!(c.select(None, None, Some(Utc.timestamp_opt(-1, 0).unwrap())).is_none());
    let far = Utc.timestamp_opt(40, 0).unwrap() + Duration::days(365);
    assert_eq!(c.select(None, None, Some(far)).unwrap().version, Version::new(1, 1));
  }

  #[test]
  fn deleted_chain_has_no_current_but_keeps_history() {
    let mut c = chain();
    c.deleted_at = Some(Utc.timestamp_opt(50, 0).unwrap());
    assert!(c.current().is_none());
    assert!(c.select(Some(Version::new(0, 1)), None, None).is_some());
  }
}
