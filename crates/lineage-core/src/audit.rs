//! The audit trail of ordered selections.
//!
//! History is an append-only list of [`ActionRecord`]s per parent aggregate.
//! Each record points at immutable [`SelectionSnapshot`]s: `before` is the
//! snapshot the change replaced, `after` the one it produced. For one
//! `selection_uid`, consecutive records chain `before == previous.after`.
//!
//! The current view of a selection list is never stored separately; it is the
//! `after` snapshot of the latest record per `selection_uid`, skipping items
//! whose latest record is a `Delete`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{
  Error, Result,
  capability::EntityLookup,
  config::{ReorderPolicy, SelectionPolicy},
  selection::{EntityRef, OrderedSelection, SelectionItem},
  version::Status,
};

// ─── Records ─────────────────────────────────────────────────────────────────

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
pub enum ActionKind {
  Create,
  Edit,
  Delete,
}

/// An immutable copy of one selection item as it was at some point.
///
/// Only `order` is ever rewritten in place, and only by a silent reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSnapshot {
  pub snapshot_id:   Uuid,
  pub parent_uid:    Uuid,
  pub kind:          String,
  pub selection_uid: Uuid,
  pub order:         u32,
  pub payload:       serde_json::Value,
  pub references:    Vec<EntityRef>,
  pub author:        String,
  pub created_at:    DateTime<Utc>,
  /// Set on the terminal snapshot a `Delete` produces.
  pub deleted:       bool,
}

impl SelectionSnapshot {
  /// The item as the aggregate sees it, remembering where it was read from.
  pub fn to_item(&self) -> SelectionItem {
    SelectionItem {
      selection_uid: self.selection_uid,
      order:         self.order,
      payload:       self.payload.clone(),
      references:    self.references.clone(),
      snapshot_id:   Some(self.snapshot_id),
    }
  }
}

/// An action record before the store has assigned its sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActionRecord {
  pub record_id:      Uuid,
  pub parent_uid:     Uuid,
  pub selection_kind: String,
  pub selection_uid:  Uuid,
  pub kind:           ActionKind,
  pub timestamp:      DateTime<Utc>,
  pub author:         String,
  pub before:         Option<Uuid>,
  pub after:          Option<Uuid>,
}

impl NewActionRecord {
  pub fn with_seq(self, seq: u64) -> ActionRecord {
    ActionRecord {
      seq,
      record_id: self.record_id,
      parent_uid: self.parent_uid,
      selection_kind: self.selection_kind,
      selection_uid: self.selection_uid,
      kind: self.kind,
      timestamp: self.timestamp,
      author: self.author,
      before: self.before,
      after: self.after,
    }
  }
}

/// A persisted action record. `seq` increases monotonically across the store
/// and breaks ties between records that share a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
  pub seq:            u64,
  pub record_id:      Uuid,
  pub parent_uid:     Uuid,
  pub selection_kind: String,
  pub selection_uid:  Uuid,
  pub kind:           ActionKind,
  pub timestamp:      DateTime<Utc>,
  pub author:         String,
  pub before:         Option<Uuid>,
  pub after:          Option<Uuid>,
}

/// A silent in-place order update of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reorder {
  pub snapshot_id: Uuid,
  pub order:       u32,
}

/// Everything one selection list contributes to a write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditBatch {
  pub parent_uid: Uuid,
  pub kind:       String,
  pub snapshots:  Vec<SelectionSnapshot>,
  pub records:    Vec<NewActionRecord>,
  pub reorders:   Vec<Reorder>,
}

impl AuditBatch {
  pub fn is_empty(&self) -> bool {
    self.snapshots.is_empty() && self.records.is_empty() && self.reorders.is_empty()
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Diffs the selection list as read against the list as edited.
pub struct AuditTrailBuilder<'p> {
  policy: &'p SelectionPolicy,
}

impl<'p> AuditTrailBuilder<'p> {
  pub fn new(policy: &'p SelectionPolicy) -> Self { Self { policy } }

  /// Classify every difference between `old` and `desired`.
  ///
  /// Items are matched by `selection_uid`. An old uid missing from `desired`
  /// becomes a `Delete`, which also covers a truncated tail. A uid present in
  /// both with different content becomes an `Edit`; a new uid a `Create`. An
  /// item that only moved is handled per the kind's [`ReorderPolicy`].
  pub fn plan(
    &self,
    old: &OrderedSelection,
    desired: &OrderedSelection,
  ) -> Result<AuditPlan> {
    if old.parent_uid() != desired.parent_uid() || old.kind() != desired.kind() {
      return Err(Error::validation(
        "selection",
        format!(
          "cannot diff {}/{} against {}/{}",
          old.parent_uid(),
          old.kind(),
          desired.parent_uid(),
          desired.kind()
        ),
      ));
    }

    let mut previous = HashMap::with_capacity(old.len());
    for item in old.items() {
      let snapshot_id = item.snapshot_id.ok_or_else(|| {
        Error::validation(
          "selection",
          format!("stored item {} has no snapshot", item.selection_uid),
        )
      })?;
      previous.insert(item.selection_uid, (item, snapshot_id));
    }

    let mut plan = AuditPlan {
      parent_uid: old.parent_uid(),
      kind:       old.kind().to_owned(),
      deletes:    Vec::new(),
      edits:      Vec::new(),
      creates:    Vec::new(),
      reorders:   Vec::new(),
    };

    let kept: HashSet<Uuid> = desired.items().iter().map(|i| i.selection_uid).collect();
    for item in old.items() {
      if !kept.contains(&item.selection_uid) {
        plan.deletes.push(item.clone());
      }
    }

    for item in desired.items() {
      match previous.get(&item.selection_uid) {
        None => plan.creates.push(item.clone()),
        Some((prev, _)) if !prev.same_content(item) => {
          plan.edits.push(((*prev).clone(), item.clone()));
        }
        Some((prev, snapshot_id)) if prev.order != item.order => {
          match self.policy.reorder {
            ReorderPolicy::Silent => plan.reorders.push(Reorder {
              snapshot_id: *snapshot_id,
              order:       item.order,
            }),
            ReorderPolicy::Audited => {
              plan.edits.push(((*prev).clone(), item.clone()));
            }
          }
        }
        Some(_) => {}
      }
    }

    Ok(plan)
  }
}

/// The classified difference between two versions of one selection list.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditPlan {
  pub parent_uid: Uuid,
  pub kind:       String,
  /// Old items whose uid disappeared.
  pub deletes:    Vec<SelectionItem>,
  /// `(old, new)` pairs for items whose content changed (or that moved,
  /// under an audited reorder policy).
  pub edits:      Vec<(SelectionItem, SelectionItem)>,
  pub creates:    Vec<SelectionItem>,
  pub reorders:   Vec<Reorder>,
}

impl AuditPlan {
  pub fn is_empty(&self) -> bool {
    self.deletes.is_empty()
      && self.edits.is_empty()
      && self.creates.is_empty()
      && self.reorders.is_empty()
  }

  /// Check every reference a created or edited item gains.
  ///
  /// A pinned reference must name an existing version whose status is one of
  /// `accepted`. An unpinned one needs some version of a live entity with an
  /// accepted status; a newer Draft on top of an approved version does not
  /// hide it.
  pub fn validate_references(
    &self,
    lookup: &dyn EntityLookup,
    accepted: &[Status],
  ) -> Result<()> {
    let gained = self.creates.iter().flat_map(|item| item.references.iter()).chain(
      self.edits.iter().flat_map(|(old, new)| {
        new.references.iter().filter(|r| !old.references.contains(r))
      }),
    );

    for reference in gained {
      let target = match reference.version {
        Some(version) => lookup.find_version(reference.uid, version)?,
        None => match lookup.find_latest_with_status(reference.uid, accepted)? {
          Some(found) => Some(found),
          None => lookup.find(reference.uid)?,
        },
      };
      let Some(target) = target else {
        return Err(Error::validation(
          "references",
          format!("{} does not exist", reference),
        ));
      };
      if !accepted.contains(&target.status) {
        return Err(Error::validation(
          "references",
          format!("{} is {}, which this selection does not accept", reference, target.status),
        ));
      }
    }
    Ok(())
  }

  /// Uids this plan introduces for the first time.
  pub fn created_uids(&self) -> impl Iterator<Item = Uuid> + '_ {
    self.creates.iter().map(|i| i.selection_uid)
  }

  /// Turn the plan into snapshots and records stamped with `at`.
  pub fn into_batch(self, author: &str, at: DateTime<Utc>) -> AuditBatch {
    let mut batch = AuditBatch {
      parent_uid: self.parent_uid,
      kind:       self.kind,
      snapshots:  Vec::new(),
      records:    Vec::new(),
      reorders:   self.reorders,
    };

    for old in self.deletes {
      let tombstone = batch.snapshot_of(&old, author, at, true);
      batch.record(old.selection_uid, ActionKind::Delete, old.snapshot_id, tombstone, author, at);
    }
    for (old, new) in self.edits {
      let after = batch.snapshot_of(&new, author, at, false);
      batch.record(new.selection_uid, ActionKind::Edit, old.snapshot_id, after, author, at);
    }
    for new in self.creates {
      let after = batch.snapshot_of(&new, author, at, false);
      batch.record(new.selection_uid, ActionKind::Create, None, after, author, at);
    }
    batch
  }
}

impl AuditBatch {
  fn snapshot_of(
    &mut self,
    item: &SelectionItem,
    author: &str,
    at: DateTime<Utc>,
    deleted: bool,
  ) -> Uuid {
    let snapshot_id = Uuid::new_v4();
    self.snapshots.push(SelectionSnapshot {
      snapshot_id,
      parent_uid: self.parent_uid,
      kind: self.kind.clone(),
      selection_uid: item.selection_uid,
      order: item.order,
      payload: item.payload.clone(),
      references: item.references.clone(),
      author: author.to_owned(),
      created_at: at,
      deleted,
    });
    snapshot_id
  }

  fn record(
    &mut self,
    selection_uid: Uuid,
    kind: ActionKind,
    before: Option<Uuid>,
    after: Uuid,
    author: &str,
    at: DateTime<Utc>,
  ) {
    self.records.push(NewActionRecord {
      record_id: Uuid::new_v4(),
      parent_uid: self.parent_uid,
      selection_kind: self.kind.clone(),
      selection_uid,
      kind,
      timestamp: at,
      author: author.to_owned(),
      before,
      after: Some(after),
    });
  }
}

// ─── Reading the trail ───────────────────────────────────────────────────────

/// The snapshot each live `selection_uid` currently points at, given every
/// record of one parent.
pub fn current_heads(records: &[ActionRecord]) -> BTreeMap<Uuid, Uuid> {
  let mut latest: HashMap<Uuid, &ActionRecord> = HashMap::new();
  for record in records {
    let slot = latest.entry(record.selection_uid).or_insert(record);
    if record.seq > slot.seq {
      *slot = record;
    }
  }
  latest
    .into_values()
    .filter(|r| r.kind != ActionKind::Delete)
    .filter_map(|r| r.after.map(|after| (r.selection_uid, after)))
    .collect()
}

/// Whether every `selection_uid`'s records chain correctly: the first is a
/// `Create`, each later `before` equals the previous `after`, and nothing
/// follows a `Delete`.
pub fn chain_is_consistent(records: &[ActionRecord]) -> bool {
  let mut by_uid: BTreeMap<Uuid, Vec<&ActionRecord>> = BTreeMap::new();
  for record in records {
    by_uid.entry(record.selection_uid).or_default().push(record);
  }
  by_uid.into_values().all(|mut chain| {
    chain.sort_by_key(|r| r.seq);
    chain[0].kind == ActionKind::Create
      && chain[0].before.is_none()
      && chain.windows(2).all(|pair| {
        pair[0].kind != ActionKind::Delete && pair[1].before == pair[0].after
      })
  })
}

/// One row of a selection item's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionHistoryEntry {
  pub selection_uid: Uuid,
  pub change_type:   ActionKind,
  pub snapshot:      SelectionSnapshot,
  pub start_date:    DateTime<Utc>,
  /// When the next record superseded this one; `None` for the latest.
  pub end_date:      Option<DateTime<Utc>>,
  pub author:        String,
}

/// Pair each record of one selection item with the snapshot it produced,
/// oldest first. Records whose snapshot is missing are skipped.
pub fn selection_history(
  records: &[ActionRecord],
  snapshots: &HashMap<Uuid, SelectionSnapshot>,
) -> Vec<SelectionHistoryEntry> {
  let mut ordered: Vec<&ActionRecord> = records.iter().collect();
  ordered.sort_by_key(|r| r.seq);

  let mut entries = Vec::with_capacity(ordered.len());
  for (i, record) in ordered.iter().enumerate() {
    let Some(snapshot) = record.after.and_then(|id| snapshots.get(&id)) else {
      continue;
    };
    entries.push(SelectionHistoryEntry {
      selection_uid: record.selection_uid,
      change_type:   record.kind,
      snapshot:      snapshot.clone(),
      start_date:    record.timestamp,
      end_date:      ordered.get(i + 1).map(|next| next.timestamp),
      author:        record.author.clone(),
    });
  }
  entries
}
