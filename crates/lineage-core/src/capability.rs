//! Small capability interfaces injected into the repository once, at
//! construction: entity lookup, read caching and the clock.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Duration, SubsecRound as _, Utc};
use uuid::Uuid;

use crate::{
  Result,
  entity::VersionedEntity,
  guard::LockToken,
  version::{Status, Version},
};

// ─── EntityLookup ────────────────────────────────────────────────────────────

/// Read access to other aggregates, used to check the entities a selection
/// item refers to.
pub trait EntityLookup {
  /// The current version of a live entity.
  fn find(&self, uid: Uuid) -> Result<Option<VersionedEntity>>;

  /// The most recent version of `uid` numbered `version`.
  fn find_version(&self, uid: Uuid, version: Version) -> Result<Option<VersionedEntity>>;

  /// The most recent version of a live entity whose status is in
  /// `accepted`; what an unpinned reference resolves to.
  fn find_latest_with_status(
    &self,
    uid: Uuid,
    accepted: &[Status],
  ) -> Result<Option<VersionedEntity>>;

  fn exists(&self, uid: Uuid) -> Result<bool> { Ok(self.find(uid)?.is_some()) }
}

// ─── ReadCache ───────────────────────────────────────────────────────────────

/// Identifies a cached read. `token` is the entity's lock token at the time
/// of the read, so an entry put after a concurrent commit is keyed by a
/// generation no later reader will ask for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub uid:     Uuid,
  pub token:   LockToken,
  pub version: Option<Version>,
  pub status:  Option<Status>,
}

/// A read-through cache for single-version lookups. The repository calls
/// [`ReadCache::invalidate`] synchronously inside every successful save;
/// invalidation only frees memory, since keys carry the lock token.
pub trait ReadCache: Send + Sync {
  fn get(&self, key: &CacheKey) -> Option<VersionedEntity>;
  fn put(&self, key: CacheKey, entity: VersionedEntity);
  fn invalidate(&self, uid: Uuid);
}

/// Caches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ReadCache for NoCache {
  fn get(&self, _key: &CacheKey) -> Option<VersionedEntity> { None }

  fn put(&self, _key: CacheKey, _entity: VersionedEntity) {}

  fn invalidate(&self, _uid: Uuid) {}
}

/// An unbounded in-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<CacheKey, VersionedEntity>>,
}

impl MemoryCache {
  pub fn new() -> Self { Self::default() }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl ReadCache for MemoryCache {
  fn get(&self, key: &CacheKey) -> Option<VersionedEntity> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.get(key).cloned()
  }

  fn put(&self, key: CacheKey, entity: VersionedEntity) {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.insert(key, entity);
  }

  fn invalidate(&self, uid: Uuid) {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.retain(|key, _| key.uid != uid);
  }
}

impl<T: ReadCache + ?Sized> ReadCache for Arc<T> {
  fn get(&self, key: &CacheKey) -> Option<VersionedEntity> { (**self).get(key) }

  fn put(&self, key: CacheKey, entity: VersionedEntity) { (**self).put(key, entity) }

  fn invalidate(&self, uid: Uuid) { (**self).invalidate(uid) }
}

// ─── Clock ───────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time, truncated to microseconds so timestamps survive a round
/// trip through any backend unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now().trunc_subsecs(6) }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start.trunc_subsecs(6)),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
  fn now(&self) -> DateTime<Utc> { (**self).now() }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::version::Transition;

  fn entity(uid: Uuid) -> VersionedEntity {
    VersionedEntity {
      uid,
      kind: "unit".into(),
      name: "mg".into(),
      payload: serde_json::Value::Null,
      status: Status::Draft,
      version: Version::initial(),
      transition: Transition::Create,
      start_date: Utc.timestamp_opt(0, 0).unwrap(),
      end_date: None,
      author: "a".into(),
      change_description: None,
    }
  }

  #[test]
  fn invalidate_drops_every_key_of_the_uid() {
    let cache = MemoryCache::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    for (uid, version) in [(a, None), (a, Some(Version::initial())), (b, None)] {
      cache.put(
        CacheKey {
          uid,
          token: LockToken::for_generation(uid, 1),
          version,
          status: None,
        },
        entity(uid),
      );
    }
    cache.invalidate(a);
    assert_eq!(cache.len(), 1);
    assert!(
      cache
        .get(&CacheKey {
          uid:     b,
          token:   LockToken::for_generation(b, 1),
          version: None,
          status:  None,
        })
        .is_some()
    );
  }

  #[test]
  fn manual_clock_moves_only_when_advanced() {
    let clock = ManualClock::new(Utc.timestamp_opt(100, 0).unwrap());
    assert_eq!(clock.now(), clock.now());
    clock.advance(Duration::seconds(5));
    assert_eq!(clock.now(), Utc.timestamp_opt(105, 0).unwrap());
  }
}
