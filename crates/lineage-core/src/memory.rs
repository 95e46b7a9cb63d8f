//! An in-process [`EntityStore`].
//!
//! Committed state sits behind an `RwLock`; a separate writer mutex is held
//! for the lifetime of a transaction. Writers are serialised, but readers
//! only ever take the read lock, so an open transaction does not block them.
//! A commit applies the batch to a copy of the state and swaps it in under a
//! brief write lock, and only when every write succeeded.

use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
  audit::{ActionRecord, SelectionSnapshot, current_heads},
  entity::{EntityChain, VersionedEntity},
  guard::{CommitOutcome, LockToken},
  store::{EntityQuery, EntityStore, EntityWrite, StoreTx, WriteBatch},
  version::Version,
};

#[derive(Debug, Error)]
pub enum MemoryError {
  #[error("entity {0} does not exist")]
  UnknownEntity(Uuid),

  #[error("snapshot {0} does not exist")]
  UnknownSnapshot(Uuid),

  #[error("batch for {batch} cannot write to {target}")]
  ForeignWrite { batch: Uuid, target: Uuid },
}

#[derive(Debug, Clone)]
struct Root {
  kind:       String,
  generation: u64,
  frozen:     bool,
  deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct State {
  roots:     HashMap<Uuid, Root>,
  versions:  HashMap<Uuid, Vec<VersionedEntity>>,
  snapshots: HashMap<Uuid, SelectionSnapshot>,
  records:   Vec<ActionRecord>,
  next_seq:  u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  state:  Arc<RwLock<State>>,
  writer: Arc<Mutex<()>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  fn lock(&self) -> RwLockReadGuard<'_, State> { read_state(&self.state) }
}

fn read_state(state: &RwLock<State>) -> RwLockReadGuard<'_, State> {
  state.read().unwrap_or_else(PoisonError::into_inner)
}

// ─── Reads ───────────────────────────────────────────────────────────────────

impl State {
  fn chain(&self, uid: Uuid) -> Option<EntityChain> {
    let root = self.roots.get(&uid)?;
    Some(EntityChain {
      uid,
      kind: root.kind.clone(),
      versions: self.versions.get(&uid).cloned().unwrap_or_default(),
      frozen: root.frozen,
      deleted_at: root.deleted_at,
    })
  }

  fn token(&self, uid: Uuid) -> Option<LockToken> {
    self
      .roots
      .get(&uid)
      .map(|root| LockToken::for_generation(uid, root.generation))
  }

  fn records_of(&self, parent_uid: Uuid) -> Vec<ActionRecord> {
    self
      .records
      .iter()
      .filter(|r| r.parent_uid == parent_uid)
      .cloned()
      .collect()
  }

  fn current_selections(&self, parent_uid: Uuid) -> Vec<SelectionSnapshot> {
    let mut current: Vec<SelectionSnapshot> = current_heads(&self.records_of(parent_uid))
      .values()
      .filter_map(|id| self.snapshots.get(id).cloned())
      .collect();
    current.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.order.cmp(&b.order)));
    current
  }

  fn find_version(&self, uid: Uuid, version: Version) -> Option<VersionedEntity> {
    self
      .versions
      .get(&uid)?
      .iter()
      .rev()
      .find(|v| v.version == version)
      .cloned()
  }

  fn heads(&self, include_deleted: bool) -> impl Iterator<Item = VersionedEntity> + '_ {
    self.roots.keys().filter_map(move |uid| {
      let chain = self.chain(*uid)?;
      match chain.is_deleted() {
        true if include_deleted => chain.latest().cloned(),
        true => None,
        false => chain.current().cloned(),
      }
    })
  }

  fn count_inbound_references(&self, uid: Uuid) -> usize {
    let live_parents: HashSet<Uuid> = self
      .roots
      .iter()
      .filter(|(parent, root)| **parent != uid && root.deleted_at.is_none())
      .map(|(parent, _)| *parent)
      .collect();
    live_parents
      .into_iter()
      .flat_map(|parent| self.current_selections(parent))
      .filter(|s| s.references.iter().any(|r| r.uid == uid))
      .count()
  }

  fn search(&self, query: &EntityQuery) -> Vec<VersionedEntity> {
    let mut found: Vec<VersionedEntity> = self
      .heads(query.include_deleted)
      .filter(|head| query.matches(head))
      .collect();
    found.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
    found
      .into_iter()
      .skip(query.offset.unwrap_or(0))
      .take(query.limit.unwrap_or(usize::MAX))
      .collect()
  }
}

// ─── Writes ──────────────────────────────────────────────────────────────────

impl State {
  fn apply(&mut self, batch: WriteBatch) -> Result<LockToken, MemoryError> {
    let uid = batch.uid;
    for write in batch.entity {
      match write {
        EntityWrite::AppendVersion(version) => {
          if version.uid != uid {
            return Err(MemoryError::ForeignWrite {
              batch:  uid,
              target: version.uid,
            });
          }
          self.roots.entry(uid).or_insert_with(|| Root {
            kind:       version.kind.clone(),
            generation: 0,
            frozen:     false,
            deleted_at: None,
          });
          let chain = self.versions.entry(uid).or_default();
          if let Some(open) = chain.iter_mut().rev().find(|v| v.end_date.is_none()) {
            open.end_date = Some(version.start_date);
          }
          chain.push(version);
        }
        EntityWrite::SoftDelete { at } => {
          self.root_mut(uid)?.deleted_at = Some(at);
        }
        EntityWrite::SetFrozen(frozen) => {
          self.root_mut(uid)?.frozen = frozen;
        }
      }
    }

    for audit in batch.audit {
      if audit.parent_uid != uid {
        return Err(MemoryError::ForeignWrite {
          batch:  uid,
          target: audit.parent_uid,
        });
      }
      for reorder in audit.reorders {
        self
          .snapshots
          .get_mut(&reorder.snapshot_id)
          .ok_or(MemoryError::UnknownSnapshot(reorder.snapshot_id))?
          .order = reorder.order;
      }
      for snapshot in audit.snapshots {
        self.snapshots.insert(snapshot.snapshot_id, snapshot);
      }
      for record in audit.records {
        self.next_seq += 1;
        self.records.push(record.with_seq(self.next_seq));
      }
    }

    let root = self.root_mut(uid)?;
    root.generation += 1;
    Ok(LockToken::for_generation(uid, root.generation))
  }

  fn root_mut(&mut self, uid: Uuid) -> Result<&mut Root, MemoryError> {
    self.roots.get_mut(&uid).ok_or(MemoryError::UnknownEntity(uid))
  }
}

// ─── Trait impls ─────────────────────────────────────────────────────────────

impl EntityStore for MemoryStore {
  type Error = MemoryError;
  type Tx<'a> = MemoryTx<'a>;

  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>, MemoryError> {
    Ok(self.lock().chain(uid))
  }

  fn current_selections(
    &self,
    parent_uid: Uuid,
  ) -> Result<Vec<SelectionSnapshot>, MemoryError> {
    Ok(self.lock().current_selections(parent_uid))
  }

  fn audit_trail(
    &self,
    parent_uid: Uuid,
    selection_uid: Option<Uuid>,
  ) -> Result<Vec<ActionRecord>, MemoryError> {
    let mut records = self.lock().records_of(parent_uid);
    records.retain(|r| selection_uid.is_none_or(|s| r.selection_uid == s));
    Ok(records)
  }

  fn snapshot(&self, snapshot_id: Uuid) -> Result<Option<SelectionSnapshot>, MemoryError> {
    Ok(self.lock().snapshots.get(&snapshot_id).cloned())
  }

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>, MemoryError> {
    Ok(self.lock().token(uid))
  }

  fn search(&self, query: &EntityQuery) -> Result<Vec<VersionedEntity>, MemoryError> {
    Ok(self.lock().search(query))
  }

  fn begin(&self) -> Result<MemoryTx<'_>, MemoryError> {
    let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(MemoryTx {
      _writer: writer,
      state:   &self.state,
    })
  }
}

/// Holds the writer mutex, so committed state cannot change underneath the
/// transaction's reads.
pub struct MemoryTx<'a> {
  _writer: MutexGuard<'a, ()>,
  state:   &'a RwLock<State>,
}

impl MemoryTx<'_> {
  fn read(&self) -> RwLockReadGuard<'_, State> { read_state(self.state) }
}

impl StoreTx for MemoryTx<'_> {
  type Error = MemoryError;

  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>, MemoryError> {
    Ok(self.read().chain(uid))
  }

  fn current_selections(
    &self,
    parent_uid: Uuid,
  ) -> Result<Vec<SelectionSnapshot>, MemoryError> {
    Ok(self.read().current_selections(parent_uid))
  }

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>, MemoryError> {
    Ok(self.read().token(uid))
  }

  fn find_version(
    &self,
    uid: Uuid,
    version: Version,
  ) -> Result<Option<VersionedEntity>, MemoryError> {
    Ok(self.read().find_version(uid, version))
  }

  fn find_current_by_name(
    &self,
    kind: &str,
    name: &str,
  ) -> Result<Option<VersionedEntity>, MemoryError> {
    Ok(
      self
        .read()
        .heads(false)
        .find(|head| head.kind == kind && head.name == name),
    )
  }

  fn count_inbound_references(&self, uid: Uuid) -> Result<usize, MemoryError> {
    Ok(self.read().count_inbound_references(uid))
  }

  fn selection_uid_known(&self, selection_uid: Uuid) -> Result<bool, MemoryError> {
    Ok(
      self
        .read()
        .records
        .iter()
        .any(|r| r.selection_uid == selection_uid),
    )
  }

  fn compare_and_commit(
    self,
    expected: Option<&LockToken>,
    batch: WriteBatch,
  ) -> Result<CommitOutcome, MemoryError> {
    let mut next = {
      let current = self.read();
      let actual = current.token(batch.uid);
      if actual.as_ref() != expected {
        return Ok(CommitOutcome::Conflict { actual });
      }
      current.clone()
    };
    let token = next.apply(batch)?;
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    Ok(CommitOutcome::Committed { token })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{entity::NewEntity, lifecycle};

  fn first_version(uid: Uuid, name: &str) -> VersionedEntity {
    lifecycle::create(uid, NewEntity::new("unit", name, json!({})), "a", Utc::now()).unwrap()
  }

  #[test]
  fn commit_requires_matching_token() {
    let store = MemoryStore::new();
    let uid = Uuid::new_v4();

    let mut batch = WriteBatch::new(uid);
    batch.entity.push(EntityWrite::AppendVersion(first_version(uid, "mg")));
    let outcome = store.begin().unwrap().compare_and_commit(None, batch.clone()).unwrap();
    let CommitOutcome::Committed { token } = outcome else {
      panic!("expected commit, got {outcome:?}");
    };
    assert_eq!(store.lock_token(uid).unwrap(), Some(token));

    // Creating the same uid again is a conflict, not an overwrite.
    let again = store.begin().unwrap().compare_and_commit(None, batch).unwrap();
    assert!(matches!(again, CommitOutcome::Conflict { actual: Some(_) }));
    assert_eq!(store.read_chain(uid).unwrap().unwrap().versions.len(), 1);
  }

  #[test]
  fn failed_batch_leaves_state_untouched() {
    let store = MemoryStore::new();
    let uid = Uuid::new_v4();
    let mut batch = WriteBatch::new(uid);
    batch.entity.push(EntityWrite::AppendVersion(first_version(uid, "mg")));
    batch.entity.push(EntityWrite::AppendVersion(first_version(Uuid::new_v4(), "x")));

    let err = store.begin().unwrap().compare_and_commit(None, batch);
    assert!(matches!(err, Err(MemoryError::ForeignWrite { .. })));
    assert!(store.read_chain(uid).unwrap().is_none());
  }

  #[test]
  fn append_closes_previous_interval() {
    let store = MemoryStore::new();
    let uid = Uuid::new_v4();
    let v0 = first_version(uid, "mg");
    let v1 = lifecycle::approve(&v0, "a", v0.start_date + chrono::Duration::seconds(1)).unwrap();

    let mut batch = WriteBatch::new(uid);
    batch.entity.push(EntityWrite::AppendVersion(v0));
    batch.entity.push(EntityWrite::AppendVersion(v1.clone()));
    store.begin().unwrap().compare_and_commit(None, batch).unwrap();

    let chain = store.read_chain(uid).unwrap().unwrap();
    assert_eq!(chain.versions[0].end_date, Some(v1.start_date));
    assert!(chain.versions[1].is_open());
  }

  #[test]
  fn open_transaction_does_not_block_readers() {
    let store = MemoryStore::new();
    let uid = Uuid::new_v4();
    let mut batch = WriteBatch::new(uid);
    batch.entity.push(EntityWrite::AppendVersion(first_version(uid, "mg")));
    store.begin().unwrap().compare_and_commit(None, batch).unwrap();
    let token = store.lock_token(uid).unwrap();

    let tx = store.begin().unwrap();
    let seen = std::thread::scope(|s| {
      s.spawn(|| (store.read_chain(uid).unwrap(), store.lock_token(uid).unwrap()))
        .join()
        .unwrap()
    });
    assert_eq!(seen.0.unwrap().versions.len(), 1);
    assert_eq!(seen.1, token);

    // The same transaction still commits once the reader is done.
    let mut batch = WriteBatch::new(uid);
    batch.entity.push(EntityWrite::SetFrozen(true));
    let outcome = tx.compare_and_commit(token.as_ref(), batch).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { .. }));
    assert!(store.read_chain(uid).unwrap().unwrap().frozen);
  }
}
