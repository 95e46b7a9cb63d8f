//! Integration tests for `SqliteStore`, driven through the repository.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use lineage_core::{
  Aggregate, AggregateRepository, Error as CoreError, FindOptions, StateViolation,
  audit::{ActionKind, chain_is_consistent},
  capability::{ManualClock, NoCache},
  config::{RepositoryConfig, SelectionPolicy},
  entity::NewEntity,
  guard::CommitOutcome,
  selection::{EntityRef, SelectionItem},
  store::{EntityQuery, EntityStore, EntityWrite, StoreTx, WriteBatch},
  version::{Status, Version},
};
use serde_json::json;
use uuid::Uuid;

use crate::SqliteStore;

type Repo = AggregateRepository<SqliteStore, NoCache, Arc<ManualClock>>;

fn repo_over(store: SqliteStore) -> (Repo, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::new(
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
  ));
  let config = RepositoryConfig::default().with_policy("units", SelectionPolicy {
    accepted_statuses: vec![Status::Draft, Status::Final],
    ..SelectionPolicy::default()
  });
  let repo = AggregateRepository::new(store)
    .with_clock(clock.clone())
    .with_config(config);
  (repo, clock)
}

fn repo() -> (Repo, Arc<ManualClock>) {
  repo_over(SqliteStore::open_in_memory().expect("in-memory store"))
}

fn save(repo: &Repo, clock: &ManualClock, agg: &mut Aggregate) {
  repo.save(agg, "alice").unwrap();
  clock.advance(Duration::seconds(1));
}

fn created(repo: &Repo, clock: &ManualClock, kind: &str, name: &str) -> Aggregate {
  let mut agg = Aggregate::create(NewEntity::new(kind, name, json!({})), "alice").unwrap();
  save(repo, clock, &mut agg);
  agg
}

fn item(name: &str) -> SelectionItem { SelectionItem::new(json!({ "name": name }), vec![]) }

// ─── Versions ────────────────────────────────────────────────────────────────

#[test]
fn version_chain_round_trips() {
  let (repo, clock) = repo();
  let mut agg = created(&repo, &clock, "study", "S-1");
  agg.edit_draft(json!({ "phase": 2 }), "bob", "phase").unwrap();
  save(&repo, &clock, &mut agg);
  agg.approve("bob").unwrap();
  save(&repo, &clock, &mut agg);
  agg.inactivate("bob").unwrap();
  save(&repo, &clock, &mut agg);
  agg.reactivate("bob").unwrap();
  save(&repo, &clock, &mut agg);
  agg.create_new_version("bob", "amend").unwrap();
  save(&repo, &clock, &mut agg);

  let history = repo.history(agg.uid()).unwrap();
  let labels: Vec<_> = history
    .iter()
    .map(|v| format!("{}/{}/{}", v.version, v.status, v.transition))
    .collect();
  assert_eq!(labels, [
    "0.1/draft/create",
    "0.2/draft/edit_draft",
    "1.0/final/approve",
    "1.0/retired/inactivate",
    "1.0/final/reactivate",
    "1.1/draft/new_version",
  ]);
  for pair in history.windows(2) {
    assert_eq!(pair[0].end_date, Some(pair[1].start_date));
  }

  let v02 = repo
    .find_by_uid(agg.uid(), FindOptions::current().version(Version::new(0, 2)))
    .unwrap();
  assert_eq!(v02.entity().payload, json!({ "phase": 2 }));
  assert_eq!(v02.entity().author, "bob");
  assert_eq!(v02.entity().change_description.as_deref(), Some("phase"));
}

#[test]
fn stale_token_conflicts_and_writes_nothing() {
  let (repo, clock) = repo();
  let agg = created(&repo, &clock, "study", "S-1");

  let mut r1 = repo.find_by_uid(agg.uid(), FindOptions::for_update()).unwrap();
  let mut r2 = repo.find_by_uid(agg.uid(), FindOptions::for_update()).unwrap();
  r1.selection_mut("arms").add(item("A")).unwrap();
  repo.save(&mut r1, "alice").unwrap();

  r2.edit_draft(json!({ "x": 1 }), "bob", "edit").unwrap();
  assert!(repo.save(&mut r2, "bob").unwrap_err().is_conflict());
  assert_eq!(repo.history(agg.uid()).unwrap().len(), 1);
}

#[test]
fn failed_batch_is_rolled_back() {
  let store = SqliteStore::open_in_memory().unwrap();
  let uid = Uuid::new_v4();
  let first =
    lineage_core::lifecycle::create(uid, NewEntity::new("unit", "mg", json!({})), "a", Utc::now())
      .unwrap();

  let mut batch = WriteBatch::new(uid);
  batch.entity.push(EntityWrite::AppendVersion(first.clone()));
  batch.entity.push(EntityWrite::AppendVersion(lineage_core::lifecycle::create(
    Uuid::new_v4(),
    NewEntity::new("unit", "kg", json!({})),
    "a",
    Utc::now(),
  )
  .unwrap()));
  assert!(store.begin().unwrap().compare_and_commit(None, batch).is_err());
  assert!(store.read_chain(uid).unwrap().is_none());

  // The connection is usable again and the uid is still free.
  let mut batch = WriteBatch::new(uid);
  batch.entity.push(EntityWrite::AppendVersion(first));
  let outcome = store.begin().unwrap().compare_and_commit(None, batch).unwrap();
  assert!(matches!(outcome, CommitOutcome::Committed { .. }));
}

#[test]
fn duplicate_name_and_delete_rules() {
  let (repo, clock) = repo();
  let mut mg = created(&repo, &clock, "unit", "mg");

  let mut clash = Aggregate::create(NewEntity::new("unit", "mg", json!({})), "bob").unwrap();
  assert!(matches!(
    repo.save(&mut clash, "bob"),
    Err(CoreError::Duplicate { field: "name", .. })
  ));

  let mut study = created(&repo, &clock, "study", "S-1");
  study
    .selection_mut("units")
    .add(SelectionItem::new(json!({}), vec![EntityRef::latest(mg.uid())]))
    .unwrap();
  save(&repo, &clock, &mut study);

  mg.soft_delete().unwrap();
  assert!(matches!(
    repo.save(&mut mg, "alice"),
    Err(CoreError::StateViolation(StateViolation::InboundReferences { count: 1, .. }))
  ));

  // Deleting the referring parent releases the reference.
  study.soft_delete().unwrap();
  save(&repo, &clock, &mut study);
  let mut mg = repo.find_by_uid(mg.uid(), FindOptions::for_update()).unwrap();
  mg.soft_delete().unwrap();
  save(&repo, &clock, &mut mg);

  assert!(matches!(
    repo.find_by_uid(mg.uid(), FindOptions::current()),
    Err(CoreError::NotFound { .. })
  ));
  repo.save(&mut clash, "bob").unwrap();
}

// ─── Selections ──────────────────────────────────────────────────────────────

#[test]
fn selection_lifecycle_and_history() {
  let (repo, clock) = repo();
  let mut study = created(&repo, &clock, "study", "S-1");
  for n in ["A", "B", "C"] {
    study.selection_mut("arms").add(item(n)).unwrap();
  }
  save(&repo, &clock, &mut study);

  let uids: Vec<_> = study
    .selection("arms")
    .unwrap()
    .items()
    .iter()
    .map(|i| i.selection_uid)
    .collect();

  // Silent reorder: order changes, no records.
  study.selection_mut("arms").set_new_order(uids[2], 1).unwrap();
  save(&repo, &clock, &mut study);
  assert_eq!(repo.audit_trail(study.uid()).unwrap().len(), 3);

  study
    .selection_mut("arms")
    .update(uids[0], json!({ "name": "A2" }), vec![])
    .unwrap();
  save(&repo, &clock, &mut study);
  study.selection_mut("arms").remove(uids[1]).unwrap();
  save(&repo, &clock, &mut study);

  let read = repo.find_by_uid(study.uid(), FindOptions::current()).unwrap();
  let arms: Vec<_> = read
    .selection("arms")
    .unwrap()
    .items()
    .iter()
    .map(|i| (i.payload["name"].as_str().unwrap().to_owned(), i.order))
    .collect();
  assert_eq!(arms, [("C".to_owned(), 1), ("A2".to_owned(), 2)]);

  let trail = repo.audit_trail(study.uid()).unwrap();
  assert!(chain_is_consistent(&trail));
  let kinds: Vec<_> = trail.iter().map(|r| r.kind).collect();
  assert_eq!(kinds, [
    ActionKind::Create,
    ActionKind::Create,
    ActionKind::Create,
    ActionKind::Edit,
    ActionKind::Delete,
  ]);

  let history = repo.selection_history(study.uid(), uids[0]).unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[1].snapshot.payload, json!({ "name": "A2" }));
  assert_eq!(history[0].end_date, Some(history[1].start_date));
}

#[test]
fn frozen_parent_rejects_selection_changes() {
  let (repo, clock) = repo();
  let mut study = created(&repo, &clock, "study", "S-1");
  study.freeze().unwrap();
  save(&repo, &clock, &mut study);

  study.selection_mut("arms").add(item("A")).unwrap();
  assert!(matches!(
    repo.save(&mut study, "alice"),
    Err(CoreError::StateViolation(StateViolation::Frozen { .. }))
  ));
  assert!(repo.audit_trail(study.uid()).unwrap().is_empty());
}

// ─── Search ──────────────────────────────────────────────────────────────────

#[test]
fn search_filters_current_heads() {
  let (repo, clock) = repo();
  created(&repo, &clock, "unit", "milligram");
  let mut kg = created(&repo, &clock, "unit", "kilogram");
  created(&repo, &clock, "study", "gram study");
  kg.approve("alice").unwrap();
  save(&repo, &clock, &mut kg);

  let names = |q: EntityQuery| -> Vec<String> {
    repo.find_all(&q).unwrap().into_iter().map(|v| v.name).collect()
  };
  assert_eq!(names(EntityQuery::kind("unit")), ["kilogram", "milligram"]);
  assert_eq!(
    names(EntityQuery {
      status: Some(Status::Final),
      ..EntityQuery::default()
    }),
    ["kilogram"]
  );
  assert_eq!(
    names(EntityQuery {
      name_contains: Some("GRAM".into()),
      limit: Some(2),
      ..EntityQuery::default()
    }),
    ["gram study", "kilogram"]
  );
}

#[test]
fn name_search_is_literal_and_unicode_case_insensitive() {
  let (repo, clock) = repo();
  created(&repo, &clock, "unit", "100%_pure");
  created(&repo, &clock, "unit", "100 pure");
  created(&repo, &clock, "unit", "Ärzteschaft");

  let names = |needle: &str| -> Vec<String> {
    let query = EntityQuery {
      name_contains: Some(needle.into()),
      ..EntityQuery::default()
    };
    let found = repo.find_all(&query).unwrap();
    // Same verdict as the in-process matcher.
    assert!(found.iter().all(|v| query.matches(v)));
    found.into_iter().map(|v| v.name).collect()
  };
  assert_eq!(names("%"), ["100%_pure"]);
  assert_eq!(names("_"), ["100%_pure"]);
  assert_eq!(names("0 p"), ["100 pure"]);
  assert_eq!(names("ärzte"), ["Ärzteschaft"]);
  assert_eq!(names("ÄRZTE"), ["Ärzteschaft"]);
}

// ─── Persistence ─────────────────────────────────────────────────────────────

#[test]
fn reopening_a_file_keeps_everything() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("lineage.db");

  let (uid, token) = {
    let (repo, clock) = repo_over(SqliteStore::open(&path).unwrap());
    let mut study = created(&repo, &clock, "study", "S-1");
    study.selection_mut("arms").add(item("A")).unwrap();
    save(&repo, &clock, &mut study);
    (study.uid(), study.lock_token().cloned())
  };

  let (repo, _) = repo_over(SqliteStore::open(&path).unwrap());
  let study = repo.find_by_uid(uid, FindOptions::for_update()).unwrap();
  assert_eq!(study.lock_token().cloned(), token);
  assert_eq!(study.selection("arms").unwrap().len(), 1);
  assert_eq!(
    study.entity().start_date,
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
  );
}

#[test]
fn file_store_reads_while_a_write_is_open() {
  let dir = tempfile::tempdir().unwrap();
  let (repo, clock) = repo_over(SqliteStore::open(dir.path().join("lineage.db")).unwrap());
  let study = created(&repo, &clock, "study", "S-1");
  let uid = study.uid();
  let store = repo.store();

  let tx = store.begin().unwrap();
  let (token, chain) = std::thread::scope(|s| {
    s.spawn(|| (store.lock_token(uid).unwrap(), store.read_chain(uid).unwrap()))
      .join()
      .unwrap()
  });
  assert_eq!(token.as_ref(), study.lock_token());
  assert_eq!(chain.unwrap().versions.len(), 1);

  let mut batch = WriteBatch::new(uid);
  batch.entity.push(EntityWrite::SetFrozen(true));
  let outcome = tx.compare_and_commit(token.as_ref(), batch).unwrap();
  let CommitOutcome::Committed { token: next } = outcome else {
    panic!("expected commit, got {outcome:?}");
  };
  assert_eq!(store.lock_token(uid).unwrap(), Some(next));
  assert!(store.read_chain(uid).unwrap().unwrap().frozen);
}
