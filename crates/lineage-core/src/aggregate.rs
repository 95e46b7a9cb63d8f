//! The in-memory read-modify-write unit.
//!
//! An [`Aggregate`] is read through [`crate::AggregateRepository::find_by_uid`],
//! changed through its lifecycle methods and selection lists, then handed to
//! [`crate::AggregateRepository::save`]. Nothing here touches storage: the
//! aggregate only remembers what it was read as (the closure) and what the
//! caller wants it to become.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Result, StateViolation,
  audit::SelectionSnapshot,
  entity::{EntityChain, NewEntity, VersionedEntity},
  guard::LockToken,
  lifecycle,
  selection::OrderedSelection,
};

/// What a read-for-update captured: the token to commit against and the
/// selection lists as they were stored.
#[derive(Debug, Clone)]
pub(crate) struct Closure {
  /// `None` for an aggregate that has never been saved.
  pub(crate) token:      Option<LockToken>,
  pub(crate) selections: BTreeMap<String, OrderedSelection>,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
  pub(crate) uid:              Uuid,
  pub(crate) kind:             String,
  /// Stored versions, oldest first.
  pub(crate) history:          Vec<VersionedEntity>,
  /// The version the read selected.
  pub(crate) selected:         VersionedEntity,
  /// Versions produced since the read, not yet saved.
  pub(crate) pending:          Vec<VersionedEntity>,
  pub(crate) deleted_at:       Option<DateTime<Utc>>,
  pub(crate) delete_requested: bool,
  pub(crate) frozen:           bool,
  pub(crate) selections:       BTreeMap<String, OrderedSelection>,
  pub(crate) closure:          Option<Closure>,
}

impl Aggregate {
  /// Start a new aggregate at Draft 0.1 with a fresh uid.
  pub fn create(input: NewEntity, author: &str) -> Result<Self> {
    Self::create_with_uid(Uuid::new_v4(), input, author)
  }

  /// Start a new aggregate under a caller-chosen uid. Saving fails with a
  /// conflict if the uid is already taken.
  pub fn create_with_uid(uid: Uuid, input: NewEntity, author: &str) -> Result<Self> {
    let first = lifecycle::create(uid, input, author, Utc::now())?;
    Ok(Self {
      uid,
      kind: first.kind.clone(),
      history: Vec::new(),
      selected: first.clone(),
      pending: vec![first],
      deleted_at: None,
      delete_requested: false,
      frozen: false,
      selections: BTreeMap::new(),
      closure: Some(Closure {
        token:      None,
        selections: BTreeMap::new(),
      }),
    })
  }

  /// Rebuild an aggregate from stored state. `token` is set only for a
  /// read-for-update.
  pub(crate) fn from_store(
    chain: EntityChain,
    selected: VersionedEntity,
    snapshots: Vec<SelectionSnapshot>,
    token: Option<LockToken>,
  ) -> Self {
    let mut by_kind: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for snapshot in snapshots {
      by_kind
        .entry(snapshot.kind.clone())
        .or_default()
        .push(snapshot.to_item());
    }
    let selections: BTreeMap<String, OrderedSelection> = by_kind
      .into_iter()
      .map(|(kind, items)| {
        let list = OrderedSelection::from_items(chain.uid, kind.clone(), items);
        (kind, list)
      })
      .collect();

    let closure = token.map(|token| Closure {
      token:      Some(token),
      selections: selections.clone(),
    });
    Self {
      uid: chain.uid,
      kind: chain.kind,
      history: chain.versions,
      selected,
      pending: Vec::new(),
      deleted_at: chain.deleted_at,
      delete_requested: false,
      frozen: chain.frozen,
      selections,
      closure,
    }
  }

  // ── Accessors ─────────────────────────────────────────────────────────

  pub fn uid(&self) -> Uuid { self.uid }

  pub fn kind(&self) -> &str { &self.kind }

  /// The version this aggregate currently presents: the latest pending
  /// change, or else the version the read selected.
  pub fn entity(&self) -> &VersionedEntity {
    self.pending.last().unwrap_or(&self.selected)
  }

  /// Stored versions, oldest first. Pending changes are not included.
  pub fn history(&self) -> &[VersionedEntity] { &self.history }

  pub fn pending(&self) -> &[VersionedEntity] { &self.pending }

  pub fn is_frozen(&self) -> bool { self.frozen }

  pub fn is_deleted(&self) -> bool { self.deleted_at.is_some() || self.delete_requested }

  pub fn is_new(&self) -> bool {
    self.closure.as_ref().is_some_and(|c| c.token.is_none())
  }

  /// Whether [`crate::AggregateRepository::save`] will accept this aggregate.
  pub fn is_read_for_update(&self) -> bool { self.closure.is_some() }

  pub fn lock_token(&self) -> Option<&LockToken> {
    self.closure.as_ref().and_then(|c| c.token.as_ref())
  }

  pub fn selection(&self, kind: &str) -> Option<&OrderedSelection> {
    self.selections.get(kind)
  }

  /// The selection list of `kind`, created empty on first use.
  pub fn selection_mut(&mut self, kind: &str) -> &mut OrderedSelection {
    let uid = self.uid;
    self
      .selections
      .entry(kind.to_owned())
      .or_insert_with(|| OrderedSelection::new(uid, kind))
  }

  pub fn selections(&self) -> impl Iterator<Item = &OrderedSelection> {
    self.selections.values()
  }

  // ── Lifecycle ─────────────────────────────────────────────────────────

  /// Replace the payload of a Draft. Returns `false` when the payload is
  /// unchanged and nothing was recorded.
  pub fn edit_draft(
    &mut self,
    payload: serde_json::Value,
    author: &str,
    change_description: &str,
  ) -> Result<bool> {
    let next = lifecycle::edit_draft(
      self.head()?,
      None,
      payload,
      author,
      change_description,
      Utc::now(),
    )?;
    Ok(self.push(next))
  }

  /// Replace the name and payload of a Draft together.
  pub fn rename_draft(
    &mut self,
    name: impl Into<String>,
    payload: serde_json::Value,
    author: &str,
    change_description: &str,
  ) -> Result<bool> {
    let next = lifecycle::edit_draft(
      self.head()?,
      Some(name.into()),
      payload,
      author,
      change_description,
      Utc::now(),
    )?;
    Ok(self.push(next))
  }

  pub fn approve(&mut self, author: &str) -> Result<()> {
    let next = lifecycle::approve(self.head()?, author, Utc::now())?;
    self.pending.push(next);
    Ok(())
  }

  pub fn create_new_version(&mut self, author: &str, change_description: &str) -> Result<()> {
    let next =
      lifecycle::create_new_version(self.head()?, author, change_description, Utc::now())?;
    self.pending.push(next);
    Ok(())
  }

  pub fn inactivate(&mut self, author: &str) -> Result<()> {
    let next = lifecycle::inactivate(self.head()?, author, Utc::now())?;
    self.pending.push(next);
    Ok(())
  }

  pub fn reactivate(&mut self, author: &str) -> Result<()> {
    let next = lifecycle::reactivate(self.head()?, author, Utc::now())?;
    self.pending.push(next);
    Ok(())
  }

  /// Mark the aggregate for deletion. Inbound references are checked when it
  /// is saved.
  pub fn soft_delete(&mut self) -> Result<()> {
    self.head()?;
    lifecycle::check_delete(self.uid, self.history.iter().chain(&self.pending))?;
    self.delete_requested = true;
    Ok(())
  }

  /// Lock the selection lists against changes, starting with the next save.
  pub fn freeze(&mut self) -> Result<()> {
    self.head()?;
    self.frozen = true;
    Ok(())
  }

  pub fn unfreeze(&mut self) -> Result<()> {
    self.head()?;
    self.frozen = false;
    Ok(())
  }

  // ── Helpers ───────────────────────────────────────────────────────────

  /// The version lifecycle operations build on.
  fn head(&self) -> Result<&VersionedEntity> {
    if self.is_deleted() {
      return Err(StateViolation::Deleted { uid: self.uid }.into());
    }
    if let Some(latest) = self.pending.last() {
      return Ok(latest);
    }
    self
      .history
      .iter()
      .rev()
      .find(|v| v.is_open())
      .ok_or_else(|| StateViolation::Deleted { uid: self.uid }.into())
  }

  fn push(&mut self, next: Option<VersionedEntity>) -> bool {
    match next {
      Some(next) => {
        self.pending.push(next);
        true
      }
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    Error,
    selection::SelectionItem,
    version::{Status, Version},
  };

  fn draft() -> Aggregate {
    Aggregate::create(NewEntity::new("study", "S-1", json!({ "phase": 1 })), "alice").unwrap()
  }

  #[test]
  fn new_aggregate_is_pending_draft() {
    let agg = draft();
    assert!(agg.is_new());
    assert!(agg.is_read_for_update());
    assert_eq!(agg.entity().version, Version::initial());
    assert_eq!(agg.pending().len(), 1);
    assert!(agg.history().is_empty());
  }

  #[test]
  fn lifecycle_calls_stack_pending_versions() {
    let mut agg = draft();
    assert!(agg.edit_draft(json!({ "phase": 2 }), "alice", "phase").unwrap());
    assert!(!agg.edit_draft(json!({ "phase": 2 }), "alice", "again").unwrap());
    agg.approve("bob").unwrap();
    assert_eq!(agg.entity().status, Status::Final);
    assert_eq!(agg.entity().version, Version::new(1, 0));
    assert_eq!(agg.pending().len(), 3);
    assert!(matches!(
      agg.edit_draft(json!({}), "a", "x"),
      Err(Error::StateViolation(StateViolation::IllegalTransition { .. }))
    ));
  }

  #[test]
  fn soft_delete_then_any_change_is_refused() {
    let mut agg = draft();
    agg.soft_delete().unwrap();
    assert!(agg.is_deleted());
    assert!(matches!(
      agg.approve("a"),
      Err(Error::StateViolation(StateViolation::Deleted { .. }))
    ));
  }

  #[test]
  fn soft_delete_refused_after_pending_approval() {
    let mut agg = draft();
    agg.approve("a").unwrap();
    assert!(agg.soft_delete().is_err());
    assert!(!agg.is_deleted());
  }

  #[test]
  fn selection_mut_creates_lists_under_this_parent() {
    let mut agg = draft();
    agg
      .selection_mut("arms")
      .add(SelectionItem::new(json!({ "name": "A" }), vec![]))
      .unwrap();
    let arms = agg.selection("arms").unwrap();
    assert_eq!(arms.parent_uid(), agg.uid());
    assert_eq!(arms.len(), 1);
    assert!(agg.selection("endpoints").is_none());
  }
}
