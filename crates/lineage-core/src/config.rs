//! Repository configuration.
//!
//! Deserialisable so binaries can load it from a config file, e.g.:
//!
//! ```toml
//! guard_order = "lock_first"
//!
//! [selections.arms]
//! reorder = "audited"
//!
//! [selections.criteria]
//! accepted_statuses = ["final", "draft"]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::version::Status;

/// Which check runs first when both the optimistic lock and the frozen-parent
/// rule would reject a save. Only the reported error differs; either way
/// nothing is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOrder {
  #[default]
  FrozenFirst,
  LockFirst,
}

/// Whether a pure reorder (no payload change) is written to the audit trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderPolicy {
  /// Update the stored snapshot's order in place; no action record.
  #[default]
  Silent,
  /// Record every moved item as an `Edit`.
  Audited,
}

/// Rules for one kind of selection list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
  #[serde(default)]
  pub reorder:           ReorderPolicy,
  /// Statuses a referenced entity may be in when an item is added or edited.
  #[serde(default = "default_accepted_statuses")]
  pub accepted_statuses: Vec<Status>,
}

impl Default for SelectionPolicy {
  fn default() -> Self {
    Self {
      reorder:           ReorderPolicy::default(),
      accepted_statuses: default_accepted_statuses(),
    }
  }
}

fn default_accepted_statuses() -> Vec<Status> { vec![Status::Final] }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
  #[serde(default)]
  pub guard_order:       GuardOrder,
  /// Per-kind policies, keyed by selection kind.
  #[serde(default)]
  pub selections:        BTreeMap<String, SelectionPolicy>,
  /// Policy for kinds not listed in `selections`.
  #[serde(default)]
  pub default_selection: SelectionPolicy,
}

impl RepositoryConfig {
  pub fn policy_for(&self, kind: &str) -> &SelectionPolicy {
    self.selections.get(kind).unwrap_or(&self.default_selection)
  }

  pub fn with_policy(mut self, kind: impl Into<String>, policy: SelectionPolicy) -> Self {
    self.selections.insert(kind.into(), policy);
    self
  }

  pub fn with_guard_order(mut self, order: GuardOrder) -> Self {
    self.guard_order = order;
    self
  }
}
