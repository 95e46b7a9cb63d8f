//! Ordered selection lists. These are numbered, reorderable lists of child items that
//! belong to one aggregate (the arms, endpoints or criteria of a study).
//!
//! [`OrderedSelection`] is a pure value object. Its operations never touch
//! storage; the difference between the list as read and the list as edited is
//! turned into audit records by [`crate::audit::AuditTrailBuilder`] when the
//! aggregate is saved.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  capability::EntityLookup,
  version::{Status, Version},
};

// ─── EntityRef ───────────────────────────────────────────────────────────────

/// A reference from a selection item to another versioned entity, optionally
/// pinned to one of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
  pub uid:      Uuid,
  pub version:  Option<Version>,
  /// A newer target version someone reviewed and chose to stay pinned
  /// below. Only a version past this one makes the reference outdated again.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accepted: Option<Version>,
}

impl EntityRef {
  pub fn latest(uid: Uuid) -> Self {
    Self {
      uid,
      version: None,
      accepted: None,
    }
  }

  pub fn pinned(uid: Uuid, version: Version) -> Self {
    Self {
      uid,
      version: Some(version),
      accepted: None,
    }
  }
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.version {
      Some(v) => write!(f, "{}@{v}", self.uid),
      None => write!(f, "{}", self.uid),
    }
  }
}

/// Parses `uid` or `uid@major.minor`.
impl FromStr for EntityRef {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let (uid, version) = match s.split_once('@') {
      Some((uid, v)) => (uid, Some(v.parse()?)),
      None => (s, None),
    };
    let uid = Uuid::parse_str(uid.trim())
      .map_err(|e| Error::validation("reference", e.to_string()))?;
    Ok(Self {
      uid,
      version,
      accepted: None,
    })
  }
}

// ─── SelectionItem ───────────────────────────────────────────────────────────

/// One entry of an ordered selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionItem {
  /// Survives reordering and in-place edits; never reused once removed.
  pub selection_uid: Uuid,
  /// 1-based position, contiguous across the list.
  pub order:         u32,
  pub payload:       serde_json::Value,
  pub references:    Vec<EntityRef>,
  /// The stored snapshot this item was read from; `None` until persisted.
  pub snapshot_id:   Option<Uuid>,
}

impl SelectionItem {
  /// A fresh item with a newly generated `selection_uid`. Its order is
  /// assigned when it is added to a list.
  pub fn new(payload: serde_json::Value, references: Vec<EntityRef>) -> Self {
    Self {
      selection_uid: Uuid::new_v4(),
      order: 0,
      payload,
      references,
      snapshot_id: None,
    }
  }

  /// Same payload and references, ignoring order and storage identity.
  pub fn same_content(&self, other: &Self) -> bool {
    self.payload == other.payload && self.references == other.references
  }
}

// ─── OutdatedReference ───────────────────────────────────────────────────────

/// A pinned reference whose target has a newer version with an accepted
/// status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedReference {
  pub selection_uid: Uuid,
  pub reference:     EntityRef,
  pub latest:        Version,
}

// ─── OrderedSelection ────────────────────────────────────────────────────────

/// A numbered list of [`SelectionItem`]s of one kind under one parent.
///
/// Invariant: after every operation the `order` values are exactly `1..=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedSelection {
  parent_uid: Uuid,
  kind:       String,
  items:      Vec<SelectionItem>,
}

impl OrderedSelection {
  pub fn new(parent_uid: Uuid, kind: impl Into<String>) -> Self {
    Self {
      parent_uid,
      kind: kind.into(),
      items: Vec::new(),
    }
  }

  /// Rebuild a list from stored items, sorting by their stored order and
  /// renumbering so the invariant holds even over damaged data.
  pub fn from_items(
    parent_uid: Uuid,
    kind: impl Into<String>,
    mut items: Vec<SelectionItem>,
  ) -> Self {
    items.sort_by_key(|i| i.order);
    let mut list = Self {
      parent_uid,
      kind: kind.into(),
      items,
    };
    list.renumber();
    list
  }

  pub fn parent_uid(&self) -> Uuid { self.parent_uid }

  pub fn kind(&self) -> &str { &self.kind }

  pub fn items(&self) -> &[SelectionItem] { &self.items }

  pub fn len(&self) -> usize { self.items.len() }

  pub fn is_empty(&self) -> bool { self.items.is_empty() }

  pub fn get(&self, selection_uid: Uuid) -> Option<&SelectionItem> {
    self.items.iter().find(|i| i.selection_uid == selection_uid)
  }

  /// 0-based position of an item.
  pub fn position_of(&self, selection_uid: Uuid) -> Option<usize> {
    self
      .items
      .iter()
      .position(|i| i.selection_uid == selection_uid)
  }

  /// Append an item at the end of the list.
  ///
  /// A related entity may be referenced at most once per list, and a
  /// `selection_uid` may only appear once.
  pub fn add(&mut self, mut item: SelectionItem) -> Result<&SelectionItem> {
    if let Some(existing) = self.get(item.selection_uid) {
      return Err(Error::Duplicate {
        field:    "selection_uid",
        value:    item.selection_uid.to_string(),
        existing: existing.selection_uid,
      });
    }
    self.check_references(&item.references, None)?;
    item.order = self.items.len() as u32 + 1;
    item.snapshot_id = None;
    self.items.push(item);
    Ok(&self.items[self.items.len() - 1])
  }

  /// Remove an item and close the gap it leaves.
  pub fn remove(&mut self, selection_uid: Uuid) -> Result<SelectionItem> {
    let index = self.require(selection_uid)?;
    let removed = self.items.remove(index);
    self.renumber();
    Ok(removed)
  }

  /// Replace an item's payload and references, keeping its uid and position.
  pub fn update(
    &mut self,
    selection_uid: Uuid,
    payload: serde_json::Value,
    references: Vec<EntityRef>,
  ) -> Result<()> {
    let index = self.require(selection_uid)?;
    self.check_references(&references, Some(selection_uid))?;
    let item = &mut self.items[index];
    item.payload = payload;
    item.references = references;
    Ok(())
  }

  /// Move an item to `new_order`, shifting everything in between.
  ///
  /// Out-of-range targets are clamped into `[1, N]` rather than rejected.
  pub fn set_new_order(&mut self, selection_uid: Uuid, new_order: i64) -> Result<()> {
    let index = self.require(selection_uid)?;
    let target = new_order.clamp(1, self.items.len() as i64) as usize - 1;
    let item = self.items.remove(index);
    self.items.insert(target, item);
    self.renumber();
    Ok(())
  }

  /// Pinned references whose target has moved past the pin. The newest
  /// version with a status in `accepted` counts, so an open draft above an
  /// approved version does not. Unpinned references always follow the
  /// target, and deleted targets are left to save-time validation.
  pub fn outdated_references(
    &self,
    lookup: &dyn EntityLookup,
    accepted: &[Status],
  ) -> Result<Vec<OutdatedReference>> {
    let mut outdated = Vec::new();
    for item in &self.items {
      for reference in &item.references {
        let Some(pinned) = reference.version else { continue };
        let Some(latest) = lookup.find_latest_with_status(reference.uid, accepted)? else {
          continue;
        };
        let seen = reference.accepted.map_or(pinned, |a| a.max(pinned));
        if latest.version > seen {
          outdated.push(OutdatedReference {
            selection_uid: item.selection_uid,
            reference:     *reference,
            latest:        latest.version,
          });
        }
      }
    }
    Ok(outdated)
  }

  /// Re-pin the item's reference to `target` at `version`. The change is an
  /// ordinary edit of the item and is audited as one on save.
  pub fn update_reference_version(
    &mut self,
    selection_uid: Uuid,
    target: Uuid,
    version: Version,
  ) -> Result<()> {
    let reference = self.reference_mut(selection_uid, target)?;
    reference.version = Some(version);
    reference.accepted = None;
    Ok(())
  }

  /// Keep the current pin but record that `version` of `target` was reviewed,
  /// so the reference stops being reported until the target moves again.
  pub fn accept_reference_version(
    &mut self,
    selection_uid: Uuid,
    target: Uuid,
    version: Version,
  ) -> Result<()> {
    let reference = self.reference_mut(selection_uid, target)?;
    if reference.version.is_none() {
      return Err(Error::validation(
        "reference",
        format!("{target} is not pinned, there is no version to accept"),
      ));
    }
    reference.accepted = Some(version);
    Ok(())
  }

  fn reference_mut(&mut self, selection_uid: Uuid, target: Uuid) -> Result<&mut EntityRef> {
    let index = self.require(selection_uid)?;
    self.items[index]
      .references
      .iter_mut()
      .find(|r| r.uid == target)
      .ok_or_else(|| {
        Error::validation(
          "reference",
          format!("item {selection_uid} does not reference {target}"),
        )
      })
  }

  fn require(&self, selection_uid: Uuid) -> Result<usize> {
    self
      .position_of(selection_uid)
      .ok_or(Error::SelectionNotFound {
        parent_uid: self.parent_uid,
        selection_uid,
      })
  }

  fn check_references(&self, refs: &[EntityRef], skip: Option<Uuid>) -> Result<()> {
    for (i, r) in refs.iter().enumerate() {
      if refs[..i].iter().any(|earlier| earlier.uid == r.uid) {
        return Err(Error::validation(
          "references",
          format!("{} is listed twice on one item", r.uid),
        ));
      }
    }
    let clash = self
      .items
      .iter()
      .filter(|i| Some(i.selection_uid) != skip)
      .find_map(|i| {
        i.references
          .iter()
          .find(|existing| refs.iter().any(|r| r.uid == existing.uid))
          .map(|r| (i.selection_uid, r.uid))
      });
    match clash {
      Some((existing, uid)) => Err(Error::Duplicate {
        field: "reference",
        value: uid.to_string(),
        existing,
      }),
      None => Ok(()),
    }
  }

  fn renumber(&mut self) {
    for (i, item) in self.items.iter_mut().enumerate() {
      item.order = i as u32 + 1;
    }
  }
}
