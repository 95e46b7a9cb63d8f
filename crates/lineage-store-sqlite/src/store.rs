//! [`SqliteStore`], the SQLite implementation of [`EntityStore`].

use std::{
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use lineage_core::{
  audit::{ActionRecord, AuditBatch, SelectionSnapshot},
  entity::{EntityChain, VersionedEntity},
  guard::{CommitOutcome, LockToken},
  store::{EntityQuery, EntityStore, EntityWrite, StoreTx, WriteBatch},
  version::Version,
};
use rusqlite::{Connection, functions::FunctionFlags, params};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{encode_dt, encode_uuid},
  query,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A lineage store backed by a single SQLite file.
///
/// A file store holds two connections. Transactions run on the writer, and
/// plain reads go through the reader, which WAL lets see the last committed
/// state while a write transaction is open. An in-memory store has nowhere
/// to share between connections, so both handles point at one connection
/// and reads wait for an open transaction.
///
/// Cloning is cheap; clones share the connections.
#[derive(Clone)]
pub struct SqliteStore {
  writer: Arc<Mutex<Connection>>,
  reader: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let writer = Connection::open(path)?;
    init(&writer)?;
    let reader = Connection::open(path)?;
    configure(&reader)?;
    tracing::debug!(path = %path.display(), "opened sqlite store");
    Ok(Self {
      writer: Arc::new(Mutex::new(writer)),
      reader: Arc::new(Mutex::new(reader)),
    })
  }

  /// Open an in-memory store, for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    let conn = Arc::new(Mutex::new(conn));
    Ok(Self {
      writer: conn.clone(),
      reader: conn,
    })
  }

  /// Run `f` inside a deferred read transaction, so a read made of several
  /// statements sees one committed state.
  fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
    let tx = conn.unchecked_transaction()?;
    let out = f(&*tx)?;
    tx.commit()?;
    Ok(out)
  }

  fn write(&self) -> MutexGuard<'_, Connection> {
    self.writer.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn init(conn: &Connection) -> Result<()> {
  configure(conn)?;
  conn.execute_batch(SCHEMA)?;
  tracing::debug!("sqlite schema ready");
  Ok(())
}

/// Per-connection setup. `fold_case` lowercases with Unicode rules, so name
/// search agrees with `str::to_lowercase`; SQLite's own `lower()` only folds
/// ASCII.
fn configure(conn: &Connection) -> Result<()> {
  conn.busy_timeout(BUSY_TIMEOUT)?;
  conn.create_scalar_function(
    "fold_case",
    1,
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
    |ctx| Ok(ctx.get::<String>(0)?.to_lowercase()),
  )?;
  Ok(())
}

impl EntityStore for SqliteStore {
  type Error = Error;
  type Tx<'a> = SqliteTx<'a>;

  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>> {
    self.read(|conn| query::read_chain(conn, uid))
  }

  fn current_selections(&self, parent_uid: Uuid) -> Result<Vec<SelectionSnapshot>> {
    self.read(|conn| query::current_selections(conn, parent_uid))
  }

  fn audit_trail(
    &self,
    parent_uid: Uuid,
    selection_uid: Option<Uuid>,
  ) -> Result<Vec<ActionRecord>> {
    self.read(|conn| query::audit_trail(conn, parent_uid, selection_uid))
  }

  fn snapshot(&self, snapshot_id: Uuid) -> Result<Option<SelectionSnapshot>> {
    self.read(|conn| query::snapshot(conn, snapshot_id))
  }

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>> {
    self.read(|conn| query::lock_token(conn, uid))
  }

  fn search(&self, query: &EntityQuery) -> Result<Vec<VersionedEntity>> {
    self.read(|conn| query::search(conn, query))
  }

  fn begin(&self) -> Result<SqliteTx<'_>> {
    let conn = self.write();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    Ok(SqliteTx {
      conn,
      finished: false,
    })
  }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// An open `BEGIN IMMEDIATE` transaction. Rolled back on drop unless
/// committed.
pub struct SqliteTx<'a> {
  conn:     MutexGuard<'a, Connection>,
  finished: bool,
}

impl SqliteTx<'_> {
  fn apply(&self, batch: WriteBatch) -> Result<LockToken> {
    let uid = batch.uid;
    let uid_str = encode_uuid(uid);

    for write in batch.entity {
      match write {
        EntityWrite::AppendVersion(version) => self.append_version(uid, version)?,
        EntityWrite::SoftDelete { at } => {
          let changed = self.conn.execute(
            "UPDATE entities SET deleted_at = ?2 WHERE uid = ?1",
            params![uid_str, encode_dt(at)],
          )?;
          if changed == 0 {
            return Err(Error::EntityNotFound(uid));
          }
        }
        EntityWrite::SetFrozen(frozen) => {
          let changed = self.conn.execute(
            "UPDATE entities SET frozen = ?2 WHERE uid = ?1",
            params![uid_str, frozen],
          )?;
          if changed == 0 {
            return Err(Error::EntityNotFound(uid));
          }
        }
      }
    }

    for audit in batch.audit {
      if audit.parent_uid != uid {
        return Err(Error::ForeignWrite {
          batch:  uid,
          target: audit.parent_uid,
        });
      }
      self.append_audit(audit)?;
    }

    let changed = self.conn.execute(
      "UPDATE entities SET generation = generation + 1 WHERE uid = ?1",
      params![uid_str],
    )?;
    if changed == 0 {
      return Err(Error::EntityNotFound(uid));
    }
    query::lock_token(&self.conn, uid)?.ok_or(Error::EntityNotFound(uid))
  }

  fn append_version(&self, uid: Uuid, version: VersionedEntity) -> Result<()> {
    if version.uid != uid {
      return Err(Error::ForeignWrite {
        batch:  uid,
        target: version.uid,
      });
    }
    let uid_str = encode_uuid(uid);
    let start = encode_dt(version.start_date);

    self.conn.execute(
      "INSERT OR IGNORE INTO entities (uid, kind, created_at) VALUES (?1, ?2, ?3)",
      params![uid_str, version.kind, start],
    )?;
    self.conn.execute(
      "UPDATE entity_versions SET end_date = ?2 WHERE uid = ?1 AND end_date IS NULL",
      params![uid_str, start],
    )?;
    self.conn.execute(
      "INSERT INTO entity_versions (
         uid, name, payload_json, status, major, minor, transition,
         start_date, end_date, author, change_description
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)",
      params![
        uid_str,
        version.name,
        version.payload.to_string(),
        version.status.to_string(),
        version.version.major,
        version.version.minor,
        version.transition.to_string(),
        start,
        version.author,
        version.change_description,
      ],
    )?;
    Ok(())
  }

  fn append_audit(&self, audit: AuditBatch) -> Result<()> {
    for reorder in audit.reorders {
      let changed = self.conn.execute(
        "UPDATE selection_snapshots SET position = ?2 WHERE snapshot_id = ?1",
        params![encode_uuid(reorder.snapshot_id), reorder.order],
      )?;
      if changed == 0 {
        return Err(Error::SnapshotNotFound(reorder.snapshot_id));
      }
    }

    for snapshot in audit.snapshots {
      let id_str = encode_uuid(snapshot.snapshot_id);
      self.conn.execute(
        "INSERT INTO selection_snapshots (
           snapshot_id, parent_uid, kind, selection_uid, position,
           payload_json, references_json, author, created_at, deleted
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
          id_str,
          encode_uuid(snapshot.parent_uid),
          snapshot.kind,
          encode_uuid(snapshot.selection_uid),
          snapshot.order,
          snapshot.payload.to_string(),
          serde_json::to_string(&snapshot.references)?,
          snapshot.author,
          encode_dt(snapshot.created_at),
          snapshot.deleted,
        ],
      )?;
      for reference in &snapshot.references {
        self.conn.execute(
          "INSERT OR IGNORE INTO snapshot_references (snapshot_id, target_uid)
           VALUES (?1, ?2)",
          params![id_str, encode_uuid(reference.uid)],
        )?;
      }
    }

    for record in audit.records {
      self.conn.execute(
        "INSERT INTO action_records (
           record_id, parent_uid, selection_kind, selection_uid, kind,
           timestamp, author, before_id, after_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
          encode_uuid(record.record_id),
          encode_uuid(record.parent_uid),
          record.selection_kind,
          encode_uuid(record.selection_uid),
          record.kind.to_string(),
          encode_dt(record.timestamp),
          record.author,
          record.before.map(encode_uuid),
          record.after.map(encode_uuid),
        ],
      )?;
    }
    Ok(())
  }
}

impl StoreTx for SqliteTx<'_> {
  type Error = Error;

  fn read_chain(&self, uid: Uuid) -> Result<Option<EntityChain>> {
    query::read_chain(&self.conn, uid)
  }

  fn current_selections(&self, parent_uid: Uuid) -> Result<Vec<SelectionSnapshot>> {
    query::current_selections(&self.conn, parent_uid)
  }

  fn lock_token(&self, uid: Uuid) -> Result<Option<LockToken>> {
    query::lock_token(&self.conn, uid)
  }

  fn find_version(&self, uid: Uuid, version: Version) -> Result<Option<VersionedEntity>> {
    query::find_version(&self.conn, uid, version)
  }

  fn find_current_by_name(&self, kind: &str, name: &str) -> Result<Option<VersionedEntity>> {
    query::find_current_by_name(&self.conn, kind, name)
  }

  fn count_inbound_references(&self, uid: Uuid) -> Result<usize> {
    query::count_inbound_references(&self.conn, uid)
  }

  fn selection_uid_known(&self, selection_uid: Uuid) -> Result<bool> {
    query::selection_uid_known(&self.conn, selection_uid)
  }

  fn compare_and_commit(
    mut self,
    expected: Option<&LockToken>,
    batch: WriteBatch,
  ) -> Result<CommitOutcome> {
    let actual = query::lock_token(&self.conn, batch.uid)?;
    if actual.as_ref() != expected {
      return Ok(CommitOutcome::Conflict { actual });
    }
    let token = self.apply(batch)?;
    self.conn.execute_batch("COMMIT")?;
    self.finished = true;
    Ok(CommitOutcome::Committed { token })
  }
}

impl Drop for SqliteTx<'_> {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    if let Err(e) = self.conn.execute_batch("ROLLBACK") {
      tracing::warn!(error = %e, "rollback failed");
    }
  }
}
