//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings with microsecond
//! precision, so string order is time order. Enums use their snake_case
//! names. Payloads and reference lists are compact JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use lineage_core::{
  audit::{ActionKind, ActionRecord, SelectionSnapshot},
  entity::VersionedEntity,
  selection::EntityRef,
  version::{Status, Transition, Version},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_enum<T: std::str::FromStr>(column: &'static str, value: String) -> Result<T> {
  value.parse().map_err(|_| Error::Decode { column, value })
}

fn decode_part(column: &'static str, value: i64) -> Result<u32> {
  u32::try_from(value).map_err(|_| Error::Decode {
    column,
    value: value.to_string(),
  })
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Columns selected for every version read. `kind` comes from the joined
/// `entities` row.
pub const VERSION_COLUMNS: &str = "v.uid, e.kind, v.name, v.payload_json, v.status, v.major, \
                                   v.minor, v.transition, v.start_date, v.end_date, \
                                   v.author, v.change_description";

/// Raw values read directly from an `entity_versions` row.
pub struct RawVersion {
  pub uid:                String,
  pub kind:               String,
  pub name:               String,
  pub payload_json:       String,
  pub status:             String,
  pub major:              i64,
  pub minor:              i64,
  pub transition:         String,
  pub start_date:         String,
  pub end_date:           Option<String>,
  pub author:             String,
  pub change_description: Option<String>,
}

impl RawVersion {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      uid:                row.get(0)?,
      kind:               row.get(1)?,
      name:               row.get(2)?,
      payload_json:       row.get(3)?,
      status:             row.get(4)?,
      major:              row.get(5)?,
      minor:              row.get(6)?,
      transition:         row.get(7)?,
      start_date:         row.get(8)?,
      end_date:           row.get(9)?,
      author:             row.get(10)?,
      change_description: row.get(11)?,
    })
  }

  pub fn into_entity(self) -> Result<VersionedEntity> {
    Ok(VersionedEntity {
      uid:                decode_uuid(&self.uid)?,
      kind:               self.kind,
      name:               self.name,
      payload:            serde_json::from_str(&self.payload_json)?,
      status:             decode_enum::<Status>("status", self.status)?,
      version:            Version::new(
        decode_part("major", self.major)?,
        decode_part("minor", self.minor)?,
      ),
      transition:         decode_enum::<Transition>("transition", self.transition)?,
      start_date:         decode_dt(&self.start_date)?,
      end_date:           self.end_date.as_deref().map(decode_dt).transpose()?,
      author:             self.author,
      change_description: self.change_description,
    })
  }
}

pub const SNAPSHOT_COLUMNS: &str = "snapshot_id, parent_uid, kind, selection_uid, position, \
                                    payload_json, references_json, author, created_at, deleted";

/// Raw values read from `selection_snapshots` or the `current_selections`
/// view.
pub struct RawSnapshot {
  pub snapshot_id:     String,
  pub parent_uid:      String,
  pub kind:            String,
  pub selection_uid:   String,
  pub position:        i64,
  pub payload_json:    String,
  pub references_json: String,
  pub author:          String,
  pub created_at:      String,
  pub deleted:         bool,
}

impl RawSnapshot {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      snapshot_id:     row.get(0)?,
      parent_uid:      row.get(1)?,
      kind:            row.get(2)?,
      selection_uid:   row.get(3)?,
      position:        row.get(4)?,
      payload_json:    row.get(5)?,
      references_json: row.get(6)?,
      author:          row.get(7)?,
      created_at:      row.get(8)?,
      deleted:         row.get(9)?,
    })
  }

  pub fn into_snapshot(self) -> Result<SelectionSnapshot> {
    let references: Vec<EntityRef> = serde_json::from_str(&self.references_json)?;
    Ok(SelectionSnapshot {
      snapshot_id: decode_uuid(&self.snapshot_id)?,
      parent_uid: decode_uuid(&self.parent_uid)?,
      kind: self.kind,
      selection_uid: decode_uuid(&self.selection_uid)?,
      order: decode_part("position", self.position)?,
      payload: serde_json::from_str(&self.payload_json)?,
      references,
      author: self.author,
      created_at: decode_dt(&self.created_at)?,
      deleted: self.deleted,
    })
  }
}

pub const RECORD_COLUMNS: &str = "seq, record_id, parent_uid, selection_kind, selection_uid, \
                                  kind, timestamp, author, before_id, after_id";

/// Raw values read directly from an `action_records` row.
pub struct RawRecord {
  pub seq:            i64,
  pub record_id:      String,
  pub parent_uid:     String,
  pub selection_kind: String,
  pub selection_uid:  String,
  pub kind:           String,
  pub timestamp:      String,
  pub author:         String,
  pub before_id:      Option<String>,
  pub after_id:       Option<String>,
}

impl RawRecord {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:            row.get(0)?,
      record_id:      row.get(1)?,
      parent_uid:     row.get(2)?,
      selection_kind: row.get(3)?,
      selection_uid:  row.get(4)?,
      kind:           row.get(5)?,
      timestamp:      row.get(6)?,
      author:         row.get(7)?,
      before_id:      row.get(8)?,
      after_id:       row.get(9)?,
    })
  }

  pub fn into_record(self) -> Result<ActionRecord> {
    Ok(ActionRecord {
      seq:            u64::try_from(self.seq).map_err(|_| Error::Decode {
        column: "seq",
        value:  self.seq.to_string(),
      })?,
      record_id:      decode_uuid(&self.record_id)?,
      parent_uid:     decode_uuid(&self.parent_uid)?,
      selection_kind: self.selection_kind,
      selection_uid:  decode_uuid(&self.selection_uid)?,
      kind:           decode_enum::<ActionKind>("kind", self.kind)?,
      timestamp:      decode_dt(&self.timestamp)?,
      author:         self.author,
      before:         self.before_id.as_deref().map(decode_uuid).transpose()?,
      after:          self.after_id.as_deref().map(decode_uuid).transpose()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_are_fixed_width_and_sortable() {
    let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let b = a + chrono::Duration::microseconds(1);
    let (ea, eb) = (encode_dt(a), encode_dt(b));
    assert_eq!(ea.len(), eb.len());
    assert!(ea < eb);
    assert_eq!(decode_dt(&eb).unwrap(), b);
  }

  #[test]
  fn unknown_status_is_a_decode_error() {
    let err = decode_enum::<Status>("status", "archived".into()).unwrap_err();
    assert!(matches!(err, Error::Decode { column: "status", .. }));
  }
}
