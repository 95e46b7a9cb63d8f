//! SQL schema for the lineage SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! schema revision; future migrations will be gated on it.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per aggregate root. `generation` is bumped by every commit and is
-- what lock tokens are derived from.
CREATE TABLE IF NOT EXISTS entities (
    uid         TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    generation  INTEGER NOT NULL DEFAULT 0,
    frozen      INTEGER NOT NULL DEFAULT 0,
    deleted_at  TEXT
);

-- Versions are append-only; only end_date is ever written after insert.
CREATE TABLE IF NOT EXISTS entity_versions (
    version_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    uid                TEXT NOT NULL REFERENCES entities(uid),
    name               TEXT NOT NULL,
    payload_json       TEXT NOT NULL,
    status             TEXT NOT NULL,   -- 'draft' | 'final' | 'retired'
    major              INTEGER NOT NULL,
    minor              INTEGER NOT NULL,
    transition         TEXT NOT NULL,
    start_date         TEXT NOT NULL,   -- fixed-width RFC 3339, microseconds
    end_date           TEXT,
    author             TEXT NOT NULL,
    change_description TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS entity_versions_open_idx
    ON entity_versions(uid) WHERE end_date IS NULL;
CREATE INDEX IF NOT EXISTS entity_versions_uid_idx
    ON entity_versions(uid, version_id);
CREATE INDEX IF NOT EXISTS entity_versions_name_idx
    ON entity_versions(name) WHERE end_date IS NULL;

-- Immutable except for `position`, which a silent reorder rewrites.
CREATE TABLE IF NOT EXISTS selection_snapshots (
    snapshot_id     TEXT PRIMARY KEY,
    parent_uid      TEXT NOT NULL REFERENCES entities(uid),
    kind            TEXT NOT NULL,
    selection_uid   TEXT NOT NULL,
    position        INTEGER NOT NULL,
    payload_json    TEXT NOT NULL,
    references_json TEXT NOT NULL DEFAULT '[]',
    author          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    deleted         INTEGER NOT NULL DEFAULT 0
);

-- Denormalised copy of references_json, for inbound-reference checks.
CREATE TABLE IF NOT EXISTS snapshot_references (
    snapshot_id  TEXT NOT NULL REFERENCES selection_snapshots(snapshot_id),
    target_uid   TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, target_uid)
);

CREATE INDEX IF NOT EXISTS snapshot_references_target_idx
    ON snapshot_references(target_uid);

-- Strictly append-only.
CREATE TABLE IF NOT EXISTS action_records (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id      TEXT NOT NULL UNIQUE,
    parent_uid     TEXT NOT NULL REFERENCES entities(uid),
    selection_kind TEXT NOT NULL,
    selection_uid  TEXT NOT NULL,
    kind           TEXT NOT NULL,   -- 'create' | 'edit' | 'delete'
    timestamp      TEXT NOT NULL,
    author         TEXT NOT NULL,
    before_id      TEXT REFERENCES selection_snapshots(snapshot_id),
    after_id       TEXT REFERENCES selection_snapshots(snapshot_id)
);

CREATE INDEX IF NOT EXISTS action_records_parent_idx
    ON action_records(parent_uid, seq);
CREATE INDEX IF NOT EXISTS action_records_selection_idx
    ON action_records(selection_uid, seq);

-- The live selection items: the snapshot of each item's latest record,
-- unless that record deleted it.
CREATE VIEW IF NOT EXISTS current_selections AS
SELECT s.*
FROM action_records r
JOIN selection_snapshots s ON s.snapshot_id = r.after_id
WHERE r.kind != 'delete'
  AND r.seq = (
    SELECT MAX(seq) FROM action_records WHERE selection_uid = r.selection_uid
  );

PRAGMA user_version = 1;
";
