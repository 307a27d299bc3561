// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Durable append-only log of pending mutations, scoped by timestamp (C9).
//!
//! Backed by `rusqlite` (bundled SQLite): crash-durable append, upsert
//! semantics by key, and timestamp-scoped cursoring come for free from a
//! relational engine instead of a hand-rolled WAL format.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Binlog row action, persisted as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Update = 1,
    Delete = 2,
}

impl Action {
    fn from_i64(value: i64) -> Result<Self> {
        match value {
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            other => Err(crate::error::Error::Invariant(format!("unknown binlog action {other}"))),
        }
    }
}

/// One pending mutation awaiting an apply cycle.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: i32,
    pub action: Action,
    /// JSON `{"features":[...]}` payload for `Update`, empty for `Delete`.
    pub features: Vec<u8>,
    /// Unix-epoch milliseconds.
    pub updated_at: i64,
}

/// The per-database binlog connection.
pub struct Binlog {
    conn: Connection,
}

impl Binlog {
    /// Opens (creating and migrating if absent) the binlog at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS features (
                key INTEGER PRIMARY KEY,
                action INTEGER NOT NULL,
                features BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS features_updated_at ON features(updated_at);",
        )?;
        Ok(Self { conn })
    }

    /// Appends (or replaces, by key) one mutation row.
    pub fn add(&self, key: i32, action: Action, features: &[u8], updated_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO features (key, action, features, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, action as i64, features, updated_at],
        )?;
        Ok(())
    }

    /// Number of rows with `updated_at <= before`.
    pub fn count(&self, before: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM features WHERE updated_at <= ?1",
            params![before],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All rows with `updated_at <= before`, ascending by `updated_at` so
    /// the Apply Engine replays them in arrival order.
    pub fn get(&self, before: i64) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, action, features, updated_at FROM features WHERE updated_at <= ?1 ORDER BY updated_at ASC",
        )?;
        let rows = stmt
            .query_map(params![before], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, action, features, updated_at) = row?;
            entries.push(Entry { key, action: Action::from_i64(action)?, features, updated_at });
        }
        Ok(entries)
    }

    /// Deletes every row with `updated_at <= before`. Called only after the
    /// shadow index built from those rows has been fully written.
    pub fn clear(&self, before: i64) -> Result<()> {
        self.conn.execute("DELETE FROM features WHERE updated_at <= ?1", params![before])?;
        Ok(())
    }

    /// Looks up the single most recent row for `key`, regardless of
    /// timestamp. Used by diagnostics only.
    pub fn latest(&self, key: i32) -> Result<Option<Entry>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, action, features, updated_at FROM features WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(key, action, features, updated_at)| {
            Ok(Entry { key, action: Action::from_i64(action)?, features, updated_at })
        })
        .transpose()
    }
}

/// Encodes a feature vector as the `{"features":[...]}` JSON payload stored
/// in the `features` blob column.
pub fn encode_features(v: &[f64]) -> Vec<u8> {
    let mut out = String::from("{\"features\":[");
    for (i, x) in v.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&x.to_string());
    }
    out.push_str("]}");
    out.into_bytes()
}

/// Decodes the `{"features":[...]}` payload back into a vector.
pub fn decode_features(bytes: &[u8]) -> Result<Vec<f64>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| crate::error::Error::Json(format!("not valid utf-8: {e}")))?;

    let start = text
        .find('[')
        .ok_or_else(|| crate::error::Error::Json("missing features array".into()))?;
    let end = text
        .rfind(']')
        .ok_or_else(|| crate::error::Error::Json("missing features array".into()))?;
    if end <= start {
        return Err(crate::error::Error::Json("malformed features array".into()));
    }

    let body = &text[start + 1..end];
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    body.split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|e| crate::error::Error::Json(format!("bad feature value {s:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_collapses_repeated_writes_for_same_key() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let log = Binlog::open(&dir.path().join("db.binlog")).expect("open");

        log.add(1, Action::Update, &encode_features(&[1.0, 2.0]), 100).expect("add");
        log.add(1, Action::Update, &encode_features(&[3.0, 4.0]), 200).expect("add");

        assert_eq!(log.count(1_000).expect("count"), 1);
        let entries = log.get(1_000).expect("get");
        assert_eq!(entries.len(), 1);
        assert_eq!(decode_features(&entries[0].features).expect("decode"), vec![3.0, 4.0]);
        assert_eq!(entries[0].updated_at, 200);
    }

    #[test]
    fn count_and_get_scope_by_cutoff() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let log = Binlog::open(&dir.path().join("db.binlog")).expect("open");

        log.add(1, Action::Update, &encode_features(&[1.0]), 100).expect("add");
        log.add(2, Action::Delete, &[], 200).expect("add");
        log.add(3, Action::Update, &encode_features(&[2.0]), 300).expect("add");

        assert_eq!(log.count(150).expect("count"), 1);
        assert_eq!(log.count(250).expect("count"), 2);

        let entries = log.get(250).expect("get");
        assert_eq!(entries.iter().map(|e| e.key).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn clear_removes_only_rows_at_or_before_cutoff() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let log = Binlog::open(&dir.path().join("db.binlog")).expect("open");

        log.add(1, Action::Update, &encode_features(&[1.0]), 100).expect("add");
        log.add(2, Action::Update, &encode_features(&[2.0]), 300).expect("add");

        log.clear(200).expect("clear");

        assert_eq!(log.count(1_000).expect("count"), 1);
        assert_eq!(log.get(1_000).expect("get")[0].key, 2);
    }

    #[test]
    fn features_round_trip_through_json_encoding() {
        let v = vec![1.5, -2.0, 0.0, 3.25];
        let encoded = encode_features(&v);
        let decoded = decode_features(&encoded).expect("decode");
        assert_eq!(decoded, v);
    }
}
