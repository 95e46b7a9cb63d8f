//! The repository facade: reads aggregates and saves them atomically.
//!
//! `save` runs, inside one store transaction:
//!
//! 1. the optimistic-lock and frozen-parent guards (in the configured order),
//! 2. the lifecycle check of every pending version, re-stamped with one
//!    commit timestamp, plus name uniqueness,
//! 3. the delete rules (never approved, no inbound references),
//! 4. the selection diffs and their reference checks,
//! 5. a single compare-and-commit of the whole batch.
//!
//! Any failure drops the transaction, so the store is left untouched.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Aggregate, Error, Result, StateViolation,
  audit::{self, ActionRecord, AuditTrailBuilder, SelectionHistoryEntry, SelectionSnapshot},
  capability::{CacheKey, Clock, NoCache, ReadCache, SystemClock},
  config::{GuardOrder, RepositoryConfig},
  entity::VersionedEntity,
  guard::{self, CommitOutcome, LockToken},
  lifecycle,
  selection::{OrderedSelection, OutdatedReference},
  store::{EntityQuery, EntityStore, EntityWrite, StoreLookup, StoreTx, TxLookup, WriteBatch},
  version::{Status, Version},
};

// ─── FindOptions ─────────────────────────────────────────────────────────────

/// Filters for [`AggregateRepository::find_by_uid`]. The default selects the
/// current version, read-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
  pub version:    Option<Version>,
  pub status:     Option<Status>,
  pub at_date:    Option<DateTime<Utc>>,
  /// Capture a lock token so the aggregate can be saved.
  pub for_update: bool,
}

impl FindOptions {
  pub fn current() -> Self { Self::default() }

  pub fn for_update() -> Self {
    Self {
      for_update: true,
      ..Self::default()
    }
  }

  pub fn version(mut self, version: Version) -> Self {
    self.version = Some(version);
    self
  }

  pub fn status(mut self, status: Status) -> Self {
    self.status = Some(status);
    self
  }

  pub fn at(mut self, at_date: DateTime<Utc>) -> Self {
    self.at_date = Some(at_date);
    self
  }

  fn not_found(&self, uid: Uuid) -> Error {
    Error::NotFound {
      uid,
      version: self.version,
      status: self.status,
      at_date: self.at_date,
    }
  }
}

// ─── Repository ──────────────────────────────────────────────────────────────

pub struct AggregateRepository<S, C = NoCache, K = SystemClock> {
  store:  S,
  cache:  C,
  clock:  K,
  config: RepositoryConfig,
}

impl<S: EntityStore> AggregateRepository<S> {
  pub fn new(store: S) -> Self {
    Self::with_parts(store, NoCache, SystemClock, RepositoryConfig::default())
  }
}

impl<S, C, K> AggregateRepository<S, C, K>
where
  S: EntityStore,
  C: ReadCache,
  K: Clock,
{
  pub fn with_parts(store: S, cache: C, clock: K, config: RepositoryConfig) -> Self {
    Self {
      store,
      cache,
      clock,
      config,
    }
  }

  pub fn with_config(mut self, config: RepositoryConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_cache<C2: ReadCache>(self, cache: C2) -> AggregateRepository<S, C2, K> {
    AggregateRepository::with_parts(self.store, cache, self.clock, self.config)
  }

  pub fn with_clock<K2: Clock>(self, clock: K2) -> AggregateRepository<S, C, K2> {
    AggregateRepository::with_parts(self.store, self.cache, clock, self.config)
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn config(&self) -> &RepositoryConfig { &self.config }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Load the aggregate `uid` at the version `options` select.
  ///
  /// With `for_update`, only the current version can be selected and the
  /// returned aggregate carries the lock token `save` commits against.
  pub fn find_by_uid(&self, uid: Uuid, options: FindOptions) -> Result<Aggregate> {
    if options.for_update && (options.version.is_some() || options.at_date.is_some()) {
      return Err(Error::validation(
        "for_update",
        "only the current version can be read for update",
      ));
    }

    // The token is read before the state it protects, so a commit landing in
    // between leaves us with a stale token rather than a stale aggregate.
    let token = match options.for_update {
      true => Some(
        self
          .store
          .lock_token(uid)
          .map_err(Error::storage)?
          .ok_or_else(|| options.not_found(uid))?,
      ),
      false => None,
    };

    let chain = self
      .store
      .read_chain(uid)
      .map_err(Error::storage)?
      .ok_or_else(|| options.not_found(uid))?;

    let selected = match options.for_update {
      true => chain
        .current()
        .filter(|v| options.status.is_none_or(|s| v.status == s)),
      false if chain.is_deleted() && options.version.is_none() && options.at_date.is_none() => {
        None
      }
      false => chain.select(options.version, options.status, options.at_date),
    }
    .cloned()
    .ok_or_else(|| options.not_found(uid))?;

    // A historical read sees the lists as they stood at that point: through
    // `at_date`, or until the selected version was superseded.
    let snapshots = match (options.at_date, selected.end_date) {
      (Some(at), _) => self.selections_as_of(uid, |r| r.timestamp <= at)?,
      (None, Some(end)) => self.selections_as_of(uid, |r| r.timestamp < end)?,
      (None, None) => self
        .store
        .current_selections(uid)
        .map_err(Error::storage)?,
    };
    Ok(Aggregate::from_store(chain, selected, snapshots, token))
  }

  /// Fold the records `include` admits into the items live at that point.
  /// Positions are those last stored on each snapshot.
  fn selections_as_of(
    &self,
    uid: Uuid,
    include: impl Fn(&ActionRecord) -> bool,
  ) -> Result<Vec<SelectionSnapshot>> {
    let records: Vec<ActionRecord> = self
      .store
      .audit_trail(uid, None)
      .map_err(Error::storage)?
      .into_iter()
      .filter(|r| include(r))
      .collect();

    let mut snapshots = Vec::new();
    for snapshot_id in audit::current_heads(&records).into_values() {
      if let Some(snapshot) = self.store.snapshot(snapshot_id).map_err(Error::storage)? {
        snapshots.push(snapshot);
      }
    }
    Ok(snapshots)
  }

  /// A single version, without selections. Exact-version reads go through
  /// the read cache, keyed by the lock token read beforehand. The result is
  /// only cached when the token is unchanged after the read, so a commit
  /// racing the read can never leave an entry a later reader would hit.
  pub fn find_entity(&self, uid: Uuid, options: FindOptions) -> Result<VersionedEntity> {
    let key = match (options.version, options.at_date) {
      (Some(version), None) => self
        .store
        .lock_token(uid)
        .map_err(Error::storage)?
        .map(|token| CacheKey {
          uid,
          token,
          version: Some(version),
          status: options.status,
        }),
      _ => None,
    };
    if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
      tracing::trace!(%uid, version = %hit.version, "cache hit");
      return Ok(hit);
    }

    let entity = self
      .find_by_uid(uid, FindOptions {
        for_update: false,
        ..options
      })?
      .entity()
      .clone();
    if let Some(key) = key {
      let after = self.store.lock_token(uid).map_err(Error::storage)?;
      if after.as_ref() == Some(&key.token) {
        self.cache.put(key, entity.clone());
      } else {
        tracing::trace!(%uid, "entity changed during read; not cached");
      }
    }
    Ok(entity)
  }

  /// Pinned references in the `kind` selection of `aggregate` whose targets
  /// have moved on, judged by the statuses that selection accepts.
  pub fn outdated_references(
    &self,
    aggregate: &Aggregate,
    kind: &str,
  ) -> Result<Vec<OutdatedReference>> {
    let Some(selection) = aggregate.selection(kind) else {
      return Ok(Vec::new());
    };
    let accepted = &self.config.policy_for(kind).accepted_statuses;
    selection.outdated_references(&StoreLookup(&self.store), accepted)
  }

  /// Current versions matching `query`.
  pub fn find_all(&self, query: &EntityQuery) -> Result<Vec<VersionedEntity>> {
    self.store.search(query).map_err(Error::storage)
  }

  /// Every stored version of `uid`, oldest first, including those of a
  /// deleted entity.
  pub fn history(&self, uid: Uuid) -> Result<Vec<VersionedEntity>> {
    self
      .store
      .read_chain(uid)
      .map_err(Error::storage)?
      .map(|chain| chain.versions)
      .ok_or_else(|| FindOptions::default().not_found(uid))
  }

  /// Every action record under `parent_uid`, in commit order.
  pub fn audit_trail(&self, parent_uid: Uuid) -> Result<Vec<ActionRecord>> {
    self
      .store
      .audit_trail(parent_uid, None)
      .map_err(Error::storage)
  }

  /// The history of one selection item, one entry per recorded change.
  pub fn selection_history(
    &self,
    parent_uid: Uuid,
    selection_uid: Uuid,
  ) -> Result<Vec<SelectionHistoryEntry>> {
    let records = self
      .store
      .audit_trail(parent_uid, Some(selection_uid))
      .map_err(Error::storage)?;
    if records.is_empty() {
      return Err(Error::SelectionNotFound {
        parent_uid,
        selection_uid,
      });
    }

    let mut snapshots = HashMap::with_capacity(records.len());
    for id in records.iter().filter_map(|r| r.after) {
      if let Some(snapshot) = self.store.snapshot(id).map_err(Error::storage)? {
        snapshots.insert(id, snapshot);
      }
    }
    Ok(audit::selection_history(&records, &snapshots))
  }

  // ── Save ──────────────────────────────────────────────────────────────

  /// Persist every pending change of `aggregate` atomically and return the
  /// new lock token.
  ///
  /// On success the aggregate is reloaded for update, so the caller can keep
  /// editing it. A deleted aggregate is left deleted and no longer savable.
  pub fn save(&self, aggregate: &mut Aggregate, author: &str) -> Result<LockToken> {
    let uid = aggregate.uid;
    if author.trim().is_empty() {
      return Err(Error::validation("author", "must not be empty"));
    }
    let closure = aggregate
      .closure
      .as_ref()
      .ok_or(StateViolation::NotReadForUpdate { uid })?;
    let expected = closure.token.clone();

    let mut plans = Vec::new();
    for (kind, desired) in &aggregate.selections {
      let unread = OrderedSelection::new(uid, kind.clone());
      let old = closure.selections.get(kind).unwrap_or(&unread);
      let policy = self.config.policy_for(kind);
      let plan = AuditTrailBuilder::new(policy).plan(old, desired)?;
      if !plan.is_empty() {
        plans.push((plan, policy));
      }
    }

    let tx = self.store.begin().map_err(Error::storage)?;
    let stored = tx.read_chain(uid).map_err(Error::storage)?;
    let actual = tx.lock_token(uid).map_err(Error::storage)?;

    let frozen = stored.as_ref().is_some_and(|c| c.frozen);
    let mutates = !plans.is_empty();
    match self.config.guard_order {
      GuardOrder::FrozenFirst => {
        guard::check_not_frozen(uid, frozen, mutates)?;
        guard::check_token(uid, expected.as_ref(), actual.as_ref())?;
      }
      GuardOrder::LockFirst => {
        guard::check_token(uid, expected.as_ref(), actual.as_ref())?;
        guard::check_not_frozen(uid, frozen, mutates)?;
      }
    }

    let stored_head = stored.as_ref().and_then(|c| c.latest());
    let at = match stored_head {
      Some(head) => self.clock.now().max(head.start_date),
      None => self.clock.now(),
    };

    let mut batch = WriteBatch::new(uid);

    // Versions.
    let mut prev = stored_head.cloned();
    for pending in &aggregate.pending {
      let mut next = pending.clone();
      next.start_date = at;
      next.end_date = None;
      lifecycle::validate_successor(prev.as_ref(), &next)?;
      prev = Some(next.clone());
      batch.entity.push(EntityWrite::AppendVersion(next));
    }
    if let Some(last) = aggregate.pending.last() {
      let renamed = stored_head.is_none_or(|head| head.name != last.name);
      if renamed {
        if let Some(other) = tx
          .find_current_by_name(&last.kind, &last.name)
          .map_err(Error::storage)?
          .filter(|other| other.uid != uid)
        {
          return Err(Error::Duplicate {
            field:    "name",
            value:    last.name.clone(),
            existing: other.uid,
          });
        }
      }
    }

    // Root flags.
    if aggregate.delete_requested {
      let stored_versions = stored.iter().flat_map(|c| c.versions.iter());
      lifecycle::check_delete(uid, stored_versions.chain(&aggregate.pending))?;
      let count = tx.count_inbound_references(uid).map_err(Error::storage)?;
      if count > 0 {
        return Err(StateViolation::InboundReferences { uid, count }.into());
      }
      batch.entity.push(EntityWrite::SoftDelete { at });
    }
    if aggregate.frozen != frozen {
      batch.entity.push(EntityWrite::SetFrozen(aggregate.frozen));
    }

    // Selections.
    let lookup = TxLookup(&tx);
    for (plan, policy) in &plans {
      plan.validate_references(&lookup, &policy.accepted_statuses)?;
      for selection_uid in plan.created_uids() {
        if tx.selection_uid_known(selection_uid).map_err(Error::storage)? {
          return Err(Error::Duplicate {
            field:    "selection_uid",
            value:    selection_uid.to_string(),
            existing: uid,
          });
        }
      }
    }
    batch.audit = plans
      .into_iter()
      .map(|(plan, _)| plan.into_batch(author, at))
      .collect();

    if batch.is_empty() {
      return actual.ok_or_else(|| FindOptions::default().not_found(uid));
    }

    let versions = batch.entity.len();
    let records: usize = batch.audit.iter().map(|a| a.records.len()).sum();
    let token = match tx
      .compare_and_commit(expected.as_ref(), batch)
      .map_err(Error::storage)?
    {
      CommitOutcome::Committed { token } => token,
      CommitOutcome::Conflict { actual } => {
        tracing::debug!(%uid, "commit lost the optimistic-lock race");
        return Err(Error::Conflict {
          uid,
          expected,
          actual,
        });
      }
    };
    self.cache.invalidate(uid);
    tracing::debug!(%uid, versions, records, "aggregate saved");

    if aggregate.delete_requested {
      aggregate.deleted_at = Some(at);
      aggregate.history.append(&mut aggregate.pending);
      aggregate.closure = None;
    } else {
      *aggregate = self.find_by_uid(uid, FindOptions::for_update())?;
    }
    Ok(token)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{entity::NewEntity, memory::MemoryStore};

  #[test]
  fn for_update_rejects_historical_filters() {
    let repo = AggregateRepository::new(MemoryStore::new());
    let err = repo
      .find_by_uid(Uuid::new_v4(), FindOptions::for_update().version(Version::initial()))
      .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
  }

  #[test]
  fn read_only_aggregates_cannot_be_saved() {
    let repo = AggregateRepository::new(MemoryStore::new());
    let mut agg = Aggregate::create(NewEntity::new("unit", "mg", json!({})), "a").unwrap();
    repo.save(&mut agg, "a").unwrap();

    let mut read = repo.find_by_uid(agg.uid(), FindOptions::current()).unwrap();
    read.approve("a").unwrap();
    assert!(matches!(
      repo.save(&mut read, "a"),
      Err(Error::StateViolation(StateViolation::NotReadForUpdate { .. }))
    ));
  }

  #[test]
  fn saving_without_changes_keeps_the_token() {
    let repo = AggregateRepository::new(MemoryStore::new());
    let mut agg = Aggregate::create(NewEntity::new("unit", "mg", json!({})), "a").unwrap();
    let first = repo.save(&mut agg, "a").unwrap();
    let again = repo.save(&mut agg, "a").unwrap();
    assert_eq!(first, again);
    assert_eq!(agg.lock_token(), Some(&first));
  }
}
