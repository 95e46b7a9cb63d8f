//! The `EntityStore` trait and supporting write/query types.
//!
//! The trait is implemented by storage backends (e.g. `lineage-store-sqlite`,
//! or [`crate::memory::MemoryStore`]). The repository depends on this
//! abstraction, not on any concrete backend.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error, Result,
  audit::{ActionRecord, AuditBatch, SelectionSnapshot},
  capability::EntityLookup,
  entity::{EntityChain, VersionedEntity},
  guard::{CommitOutcome, LockToken},
  version::{Status, Version},
};

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`EntityStore::search`]. Matches are made against each
/// entity's current version.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
  pub kind:            Option<String>,
  pub status:          Option<Status>,
  /// Case-insensitive substring of the current name.
  pub name_contains:   Option<String>,
  /// Also return soft-deleted entities (with their last version).
  pub include_deleted: bool,
  pub limit:           Option<usize>,
  pub offset:          Option<usize>,
}

impl EntityQuery {
  pub fn kind(kind: impl Into<String>) -> Self {
    Self {
      kind: Some(kind.into()),
      ..Self::default()
    }
  }

  /// Whether `head` passes the kind, status and name filters.
  pub fn matches(&self, head: &VersionedEntity) -> bool {
    self.kind.as_deref().is_none_or(|k| head.kind == k)
      && self.status.is_none_or(|s| head.status == s)
      && self.name_contains.as_deref().is_none_or(|needle| {
        head.name.to_lowercase().contains(&needle.to_lowercase())
      })
  }
}

// ─── Write batch ─────────────────────────────────────────────────────────────

/// A change to the entity chain of the batch's aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
  /// Append a version. The open interval of the previous head is closed at
  /// the new version's `start_date`; the root row is created on first use.
  AppendVersion(VersionedEntity),
  SoftDelete { at: DateTime<Utc> },
  SetFrozen(bool),
}

/// Everything one `save` writes, applied atomically or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
  pub uid:    Uuid,
  pub entity: Vec<EntityWrite>,
  pub audit:  Vec<AuditBatch>,
}

impl WriteBatch {
  pub fn new(uid: Uuid) -> Self {
    Self {
      uid,
      entity: Vec::new(),
      audit: Vec::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entity.is_empty() && self.audit.iter().all(AuditBatch::is_empty)
  }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Abstraction over a lineage storage backend.
///
/// Versions, snapshots and action records are append-only. The only in-place
/// updates a backend ever performs are closing a version's `end_date`, the
/// root flags (`frozen`, `deleted_at`, generation) and the `order` of a
/// snapshot during a silent reorder.
pub trait EntityStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  type Tx<'a>: StoreTx<Error = Self::Error>
  where
    Self: 'a;

  /// Every version of `uid`, oldest first. `None` if the uid never existed.
  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>, Self::Error>;

  /// The current snapshot of every live selection item under `parent_uid`.
  fn current_selections(
    &self,
    parent_uid: Uuid,
  ) -> Result<Vec<SelectionSnapshot>, Self::Error>;

  /// Action records under `parent_uid` in `seq` order, optionally narrowed to
  /// one selection item.
  fn audit_trail(
    &self,
    parent_uid: Uuid,
    selection_uid: Option<Uuid>,
  ) -> Result<Vec<ActionRecord>, Self::Error>;

  fn snapshot(&self, snapshot_id: Uuid) -> Result<Option<SelectionSnapshot>, Self::Error>;

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>, Self::Error>;

  /// Current versions of the entities matching `query`, ordered by kind then
  /// name.
  fn search(&self, query: &EntityQuery) -> Result<Vec<VersionedEntity>, Self::Error>;

  /// Open a write transaction. Writers are serialised; readers are not
  /// blocked by an open transaction except where the backend says otherwise.
  fn begin(&self) -> Result<Self::Tx<'_>, Self::Error>;
}

/// An open write transaction. Dropping it without committing rolls back.
pub trait StoreTx {
  type Error: std::error::Error + Send + Sync + 'static;

  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>, Self::Error>;

  fn current_selections(
    &self,
    parent_uid: Uuid,
  ) -> Result<Vec<SelectionSnapshot>, Self::Error>;

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>, Self::Error>;

  /// The most recent version of `uid` numbered `version`.
  fn find_version(
    &self,
    uid: Uuid,
    version: Version,
  ) -> Result<Option<VersionedEntity>, Self::Error>;

  /// The live entity of `kind` whose current name is `name`.
  fn find_current_by_name(
    &self,
    kind: &str,
    name: &str,
  ) -> Result<Option<VersionedEntity>, Self::Error>;

  /// How many live selection items under other live parents refer to `uid`.
  fn count_inbound_references(&self, uid: Uuid) -> Result<usize, Self::Error>;

  /// Whether `selection_uid` was ever used, under any parent.
  fn selection_uid_known(&self, selection_uid: Uuid) -> Result<bool, Self::Error>;

  /// Atomically verify that the stored token of `batch.uid` equals
  /// `expected` (`None` meaning the uid must not exist yet) and apply the
  /// batch, bumping the generation. On a mismatch nothing is written.
  fn compare_and_commit(
    self,
    expected: Option<&LockToken>,
    batch: WriteBatch,
  ) -> Result<CommitOutcome, Self::Error>;
}

// ─── Lookup over a transaction ───────────────────────────────────────────────

/// Adapts an open transaction to [`EntityLookup`], so reference checks see
/// the same snapshot the commit is based on.
pub struct TxLookup<'t, T>(pub &'t T);

impl<T: StoreTx> EntityLookup for TxLookup<'_, T> {
  fn find(&self, uid: Uuid) -> Result<Option<VersionedEntity>> {
    let chain = self.0.read_chain(uid).map_err(Error::storage)?;
    Ok(chain.and_then(|c| c.current().cloned()))
  }

  fn find_version(&self, uid: Uuid, version: Version) -> Result<Option<VersionedEntity>> {
    self.0.find_version(uid, version).map_err(Error::storage)
  }

  fn find_latest_with_status(
    &self,
    uid: Uuid,
    accepted: &[Status],
  ) -> Result<Option<VersionedEntity>> {
    let chain = self.0.read_chain(uid).map_err(Error::storage)?;
    Ok(chain.and_then(|c| c.latest_with_status(accepted).cloned()))
  }
}

/// Adapts a store to [`EntityLookup`] for reads outside any transaction.
pub struct StoreLookup<'s, S>(pub &'s S);

impl<S: EntityStore> EntityLookup for StoreLookup<'_, S> {
  fn find(&self, uid: Uuid) -> Result<Option<VersionedEntity>> {
    let chain = self.0.read_chain(uid).map_err(Error::storage)?;
    Ok(chain.and_then(|c| c.current().cloned()))
  }

  fn find_version(&self, uid: Uuid, version: Version) -> Result<Option<VersionedEntity>> {
    let chain = self.0.read_chain(uid).map_err(Error::storage)?;
    Ok(chain.and_then(|c| c.versions.into_iter().rev().find(|v| v.version == version)))
  }

  fn find_latest_with_status(
    &self,
    uid: Uuid,
    accepted: &[Status],
  ) -> Result<Option<VersionedEntity>> {
    let chain = self.0.read_chain(uid).map_err(Error::storage)?;
    Ok(chain.and_then(|c| c.latest_with_status(accepted).cloned()))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::entity::NewEntity;

  #[test]
  fn query_matches_current_head() {
    let head = crate::lifecycle::create(
      Uuid::new_v4(),
      NewEntity::new("unit", "Milligram", json!({})),
      "a",
      Utc::now(),
    )
    .unwrap();

    assert!(EntityQuery::default().matches(&head));
    assert!(EntityQuery::kind("unit").matches(&head));
    assert!(!EntityQuery::kind("study").matches(&head));

    let by_name = EntityQuery {
      name_contains: Some("GRAM".into()),
      status: Some(Status::Draft),
      ..EntityQuery::default()
    };
    assert!(by_name.matches(&head));
    let wrong_status = EntityQuery {
      status: Some(Status::Final),
      ..EntityQuery::default()
    };
    assert!(!wrong_status.matches(&head));
  }

  #[test]
  fn empty_audit_batches_do_not_count() {
    let uid = Uuid::new_v4();
    let mut batch = WriteBatch::new(uid);
    batch.audit.push(AuditBatch {
      parent_uid: uid,
      kind:       "arms".into(),
      snapshots:  vec![],
      records:    vec![],
      reorders:   vec![],
    });
    assert!(batch.is_empty());
    batch.entity.push(EntityWrite::SetFrozen(true));
    assert!(!batch.is_empty());
  }
}
