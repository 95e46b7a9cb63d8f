//! Version numbers, lifecycle statuses and the transitions between them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result};

// ─── Version ─────────────────────────────────────────────────────────────────

/// A semantic `major.minor` version.
///
/// Ordering is numeric on the `(major, minor)` pair, so `1.10 > 1.9`.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
  pub major: u32,
  pub minor: u32,
}

impl Version {
  pub const fn new(major: u32, minor: u32) -> Self { Self { major, minor } }

  /// The version every entity is created at.
  pub const fn initial() -> Self { Self::new(0, 1) }

  pub fn next_minor(self) -> Result<Self> {
    let minor = self.minor.checked_add(1).ok_or_else(|| self.exhausted("minor"))?;
    Ok(Self::new(self.major, minor))
  }

  /// The version an approval produces: next major, minor reset to zero.
  pub fn next_major(self) -> Result<Self> {
    let major = self.major.checked_add(1).ok_or_else(|| self.exhausted("major"))?;
    Ok(Self::new(major, 0))
  }

  fn exhausted(self, part: &str) -> Error {
    Error::validation("version", format!("{self} has no next {part} version"))
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.major, self.minor)
  }
}

impl FromStr for Version {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || Error::validation("version", format!("{s:?} is not major.minor"));
    let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
    Ok(Self {
      major: major.parse().map_err(|_| invalid())?,
      minor: minor.parse().map_err(|_| invalid())?,
    })
  }
}

impl From<Version> for String {
  fn from(v: Version) -> Self { v.to_string() }
}

impl TryFrom<String> for Version {
  type Error = Error;

  fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a single version.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
  Draft,
  Final,
  Retired,
}

// ─── Transition ──────────────────────────────────────────────────────────────

/// The lifecycle operation that produced a version. Stored alongside every
/// version as its change type.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transition {
  Create,
  EditDraft,
  Approve,
  NewVersion,
  Inactivate,
  Reactivate,
}

impl Transition {
  /// Statuses the transition may start from. `Create` starts from nothing.
  pub const fn allowed_from(self) -> &'static [Status] {
    match self {
      Self::Create => &[],
      Self::EditDraft | Self::Approve => &[Status::Draft],
      Self::NewVersion => &[Status::Final, Status::Retired],
      Self::Inactivate => &[Status::Final],
      Self::Reactivate => &[Status::Retired],
    }
  }

  /// Status after the transition.
  pub const fn target(self) -> Status {
    match self {
      Self::Create | Self::EditDraft | Self::NewVersion => Status::Draft,
      Self::Approve | Self::Reactivate => Status::Final,
      Self::Inactivate => Status::Retired,
    }
  }

  /// Version after the transition, given the version it starts from.
  pub fn next_version(self, from: Version) -> Result<Version> {
    match self {
      Self::Create => Ok(Version::initial()),
      Self::EditDraft | Self::NewVersion => from.next_minor(),
      Self::Approve => from.next_major(),
      Self::Inactivate | Self::Reactivate => Ok(from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ordering_is_numeric() {
    let v19: Version = "1.9".parse().unwrap();
    let v110: Version = "1.10".parse().unwrap();
    assert!(v110 > v19);
    assert!(Version::new(2, 0) > v110);
  }

  #[test]
  fn parse_rejects_garbage() {
    assert!("1".parse::<Version>().is_err());
    assert!("a.b".parse::<Version>().is_err());
    assert!("1.-1".parse::<Version>().is_err());
    assert_eq!(" 3.4 ".parse::<Version>().unwrap(), Version::new(3, 4));
  }

  #[test]
  fn version_serializes_as_string() {
    let json = serde_json::to_string(&Version::new(1, 0)).unwrap();
    assert_eq!(json, "\"1.0\"");
    let back: Version = serde_json::from_str(&json).unwrap();
    assert_eq!(back, Version::new(1, 0));
  }

  #[test]
  fn approve_resets_minor() {
    assert_eq!(
      Transition::Approve.next_version(Version::new(0, 3)).unwrap(),
      Version::new(1, 0)
    );
    assert_eq!(
      Transition::Inactivate.next_version(Version::new(1, 0)).unwrap(),
      Version::new(1, 0)
    );
  }

  #[test]
  fn exhausted_numbers_are_rejected_not_wrapped() {
    let top = Version::new(u32::MAX, u32::MAX);
    assert!(matches!(top.next_minor(), Err(Error::Validation { .. })));
    assert!(matches!(top.next_major(), Err(Error::Validation { .. })));
    assert_eq!(
      Version::new(3, u32::MAX).next_major().unwrap(),
      Version::new(4, 0)
    );
    assert!(Transition::Reactivate.next_version(top).is_ok());
  }

  #[test]
  fn status_discriminants_are_snake_case() {
    assert_eq!(Status::Retired.as_ref(), "retired");
    assert_eq!("new_version".parse::<Transition>().unwrap(), Transition::NewVersion);
  }
}
