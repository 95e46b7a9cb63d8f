//! Optimistic concurrency for aggregate roots.
//!
//! A [`LockToken`] is a SHA-256 digest over the aggregate uid and its commit
//! generation, a counter every committed batch bumps. Tokens are opaque to
//! callers: two tokens are equal exactly when no commit happened in between.
//! One token covers the whole aggregate, so concurrent edits to different
//! selection items of the same parent still conflict.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result, StateViolation};

/// Opaque optimistic-lock token captured by a read-for-update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
  /// The token of `uid` at commit generation `generation`.
  pub fn for_generation(uid: Uuid, generation: u64) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(uid.as_bytes());
    hasher.update(generation.to_le_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for LockToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "\"{}\"", self.0)
  }
}

/// Result of an atomic compare-and-commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
  /// The batch was applied; `token` is the aggregate's new token.
  Committed { token: LockToken },
  /// The stored token no longer matched; nothing was written.
  Conflict { actual: Option<LockToken> },
}

/// Compare the token captured at read time with the one stored now.
///
/// `expected == None` means the aggregate is new and must not exist yet.
pub fn check_token(
  uid: Uuid,
  expected: Option<&LockToken>,
  actual: Option<&LockToken>,
) -> Result<()> {
  if expected == actual {
    return Ok(());
  }
  tracing::debug!(%uid, "optimistic lock conflict");
  Err(Error::Conflict {
    uid,
    expected: expected.cloned(),
    actual: actual.cloned(),
  })
}

/// Refuse selection mutations while the parent aggregate is frozen.
pub fn check_not_frozen(parent_uid: Uuid, frozen: bool, mutates: bool) -> Result<()> {
  if frozen && mutates {
    return Err(StateViolation::Frozen { parent_uid }.into());
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_changes_with_generation() {
    let uid = Uuid::new_v4();
    assert_eq!(LockToken::for_generation(uid, 3), LockToken::for_generation(uid, 3));
    assert_ne!(LockToken::for_generation(uid, 3), LockToken::for_generation(uid, 4));
    assert_ne!(
      LockToken::for_generation(uid, 3),
      LockToken::for_generation(Uuid::new_v4(), 3)
    );
  }

  #[test]
  fn stale_token_is_a_conflict() {
    let uid = Uuid::new_v4();
    let old = LockToken::for_generation(uid, 1);
    let new = LockToken::for_generation(uid, 2);
    assert!(check_token(uid, Some(&old), Some(&old)).is_ok());
    assert!(check_token(uid, Some(&old), Some(&new)).unwrap_err().is_conflict());
    assert!(check_token(uid, None, Some(&new)).unwrap_err().is_conflict());
  }

  #[test]
  fn frozen_only_blocks_mutations() {
    let uid = Uuid::new_v4();
    assert!(check_not_frozen(uid, true, false).is_ok());
    assert!(check_not_frozen(uid, false, true).is_ok());
    let err = check_not_frozen(uid, true, true).unwrap_err();
    assert!(err.to_string().contains("frozen"));
  }
}
