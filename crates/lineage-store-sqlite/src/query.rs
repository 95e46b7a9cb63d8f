//! Read queries shared by [`crate::SqliteStore`] and [`crate::SqliteTx`].

use lineage_core::{
  audit::{ActionRecord, SelectionSnapshot},
  entity::{EntityChain, VersionedEntity},
  guard::LockToken,
  store::EntityQuery,
  version::Version,
};
use rusqlite::{Connection, OptionalExtension as _, params};
use uuid::Uuid;

use crate::{
  Result,
  encode::{
    RECORD_COLUMNS, RawRecord, RawSnapshot, RawVersion, SNAPSHOT_COLUMNS, VERSION_COLUMNS,
    decode_dt, encode_uuid,
  },
};

pub fn read_chain(conn: &Connection, uid: Uuid) -> Result<Option<EntityChain>> {
  let uid_str = encode_uuid(uid);
  let root: Option<(String, bool, Option<String>)> = conn
    .query_row(
      "SELECT kind, frozen, deleted_at FROM entities WHERE uid = ?1",
      params![uid_str],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()?;
  let Some((kind, frozen, deleted_at)) = root else {
    return Ok(None);
  };

  let mut stmt = conn.prepare(&format!(
    "SELECT {VERSION_COLUMNS}
     FROM entity_versions v JOIN entities e ON e.uid = v.uid
     WHERE v.uid = ?1
     ORDER BY v.version_id"
  ))?;
  let versions = stmt
    .query_map(params![uid_str], RawVersion::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawVersion::into_entity)
    .collect::<Result<Vec<_>>>()?;

  Ok(Some(EntityChain {
    uid,
    kind,
    versions,
    frozen,
    deleted_at: deleted_at.as_deref().map(decode_dt).transpose()?,
  }))
}

pub fn lock_token(conn: &Connection, uid: Uuid) -> Result<Option<LockToken>> {
  let generation: Option<i64> = conn
    .query_row(
      "SELECT generation FROM entities WHERE uid = ?1",
      params![encode_uuid(uid)],
      |r| r.get(0),
    )
    .optional()?;
  Ok(generation.map(|g| LockToken::for_generation(uid, g as u64)))
}

pub fn find_version(
  conn: &Connection,
  uid: Uuid,
  version: Version,
) -> Result<Option<VersionedEntity>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {VERSION_COLUMNS}
         FROM entity_versions v JOIN entities e ON e.uid = v.uid
         WHERE v.uid = ?1 AND v.major = ?2 AND v.minor = ?3
         ORDER BY v.version_id DESC
         LIMIT 1"
      ),
      params![encode_uuid(uid), version.major, version.minor],
      RawVersion::from_row,
    )
    .optional()?;
  raw.map(RawVersion::into_entity).transpose()
}

pub fn find_current_by_name(
  conn: &Connection,
  kind: &str,
  name: &str,
) -> Result<Option<VersionedEntity>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {VERSION_COLUMNS}
         FROM entity_versions v JOIN entities e ON e.uid = v.uid
         WHERE e.kind = ?1 AND v.name = ?2
           AND v.end_date IS NULL AND e.deleted_at IS NULL
         LIMIT 1"
      ),
      params![kind, name],
      RawVersion::from_row,
    )
    .optional()?;
  raw.map(RawVersion::into_entity).transpose()
}

pub fn search(conn: &Connection, query: &EntityQuery) -> Result<Vec<VersionedEntity>> {
  let needle = query.name_contains.as_deref().map(str::to_lowercase);
  let status = query.status.map(|s| s.to_string());
  let limit = query.limit.map_or(-1, |l| l as i64);
  let offset = query.offset.unwrap_or(0) as i64;

  let mut stmt = conn.prepare(&format!(
    "SELECT {VERSION_COLUMNS}
     FROM entity_versions v JOIN entities e ON e.uid = v.uid
     WHERE v.version_id = (
             SELECT MAX(version_id) FROM entity_versions WHERE uid = v.uid
           )
       AND (?1 IS NULL OR e.kind = ?1)
       AND (?2 IS NULL OR v.status = ?2)
       AND (?3 IS NULL OR instr(fold_case(v.name), ?3) > 0)
       AND (?4 OR e.deleted_at IS NULL)
     ORDER BY e.kind, v.name
     LIMIT ?5 OFFSET ?6"
  ))?;
  stmt
    .query_map(
      params![
        query.kind.as_deref(),
        status.as_deref(),
        needle.as_deref(),
        query.include_deleted,
        limit,
        offset,
      ],
      RawVersion::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawVersion::into_entity)
    .collect()
}

pub fn current_selections(conn: &Connection, parent_uid: Uuid) -> Result<Vec<SelectionSnapshot>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {SNAPSHOT_COLUMNS}
     FROM current_selections
     WHERE parent_uid = ?1
     ORDER BY kind, position"
  ))?;
  stmt
    .query_map(params![encode_uuid(parent_uid)], RawSnapshot::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawSnapshot::into_snapshot)
    .collect()
}

pub fn snapshot(conn: &Connection, snapshot_id: Uuid) -> Result<Option<SelectionSnapshot>> {
  let raw = conn
    .query_row(
      &format!("SELECT {SNAPSHOT_COLUMNS} FROM selection_snapshots WHERE snapshot_id = ?1"),
      params![encode_uuid(snapshot_id)],
      RawSnapshot::from_row,
    )
    .optional()?;
  raw.map(RawSnapshot::into_snapshot).transpose()
}

pub fn audit_trail(
  conn: &Connection,
  parent_uid: Uuid,
  selection_uid: Option<Uuid>,
) -> Result<Vec<ActionRecord>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {RECORD_COLUMNS}
     FROM action_records
     WHERE parent_uid = ?1 AND (?2 IS NULL OR selection_uid = ?2)
     ORDER BY seq"
  ))?;
  stmt
    .query_map(
      params![encode_uuid(parent_uid), selection_uid.map(encode_uuid)],
      RawRecord::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawRecord::into_record)
    .collect()
}

/// Live selection items under other live parents that refer to `uid`.
pub fn count_inbound_references(conn: &Connection, uid: Uuid) -> Result<usize> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*)
     FROM current_selections c
     JOIN snapshot_references r ON r.snapshot_id = c.snapshot_id
     JOIN entities e ON e.uid = c.parent_uid
     WHERE r.target_uid = ?1
       AND c.parent_uid != ?1
       AND e.deleted_at IS NULL",
    params![encode_uuid(uid)],
    |r| r.get(0),
  )?;
  Ok(count as usize)
}

pub fn selection_uid_known(conn: &Connection, selection_uid: Uuid) -> Result<bool> {
  Ok(conn.query_row(
    "SELECT EXISTS (SELECT 1 FROM action_records WHERE selection_uid = ?1)",
    params![encode_uuid(selection_uid)],
    |r| r.get(0),
  )?)
}
