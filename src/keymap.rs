// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bidirectional map between caller-visible keys and internal node IDs (C4).
//!
//! Persisted as CSV because the file is also meant to be consumable by
//! external conversion tools; row order on disk is unspecified.

use std::{collections::HashMap, path::Path, sync::RwLock};

use rustc_hash::FxBuildHasher;

use crate::{error::Result, fs_util, node::NodeId};

struct Inner {
    key_to_id: HashMap<i32, NodeId, FxBuildHasher>,
    id_to_key: HashMap<NodeId, i32, FxBuildHasher>,
}

/// The live key↔id index for one database.
pub struct KeyMap {
    inner: RwLock<Inner>,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                key_to_id: HashMap::default(),
                id_to_key: HashMap::default(),
            }),
        }
    }

    /// Adds (or replaces) a key↔id pair.
    pub fn add(&self, key: i32, id: NodeId) {
        let mut inner = self.inner.write().expect("lock is poisoned");
        if let Some(old_id) = inner.key_to_id.insert(key, id) {
            inner.id_to_key.remove(&old_id);
        }
        inner.id_to_key.insert(id, key);
    }

    /// Removes the entry for `key`, returning its node ID if present.
    pub fn remove_by_key(&self, key: i32) -> Option<NodeId> {
        let mut inner = self.inner.write().expect("lock is poisoned");
        let id = inner.key_to_id.remove(&key)?;
        inner.id_to_key.remove(&id);
        Some(id)
    }

    pub fn id_from_key(&self, key: i32) -> Result<NodeId> {
        let inner = self.inner.read().expect("lock is poisoned");
        inner.key_to_id.get(&key).copied().ok_or(crate::error::Error::NotFound)
    }

    pub fn key_from_id(&self, id: NodeId) -> Result<i32> {
        let inner = self.inner.read().expect("lock is poisoned");
        inner.id_to_key.get(&id).copied().ok_or(crate::error::Error::NotFound)
    }

    pub fn contains_key(&self, key: i32) -> bool {
        self.inner.read().expect("lock is poisoned").key_to_id.contains_key(&key)
    }

    /// True when exactly one entry remains.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.inner.read().expect("lock is poisoned").key_to_id.len() == 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock is poisoned").key_to_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all `(key, id)` pairs, order unspecified.
    #[must_use]
    pub fn entries(&self) -> Vec<(i32, NodeId)> {
        self.inner
            .read()
            .expect("lock is poisoned")
            .key_to_id
            .iter()
            .map(|(&k, &id)| (k, id))
            .collect()
    }

    /// Atomically overwrites the CSV file with the current contents.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(vec![]);
        for (key, id) in self.entries() {
            writer.write_record(&[key.to_string(), id.to_string()])?;
        }
        writer.flush()?;
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;

        fs_util::rewrite_atomic(path, &bytes)?;
        Ok(())
    }

    /// Loads (replacing any in-memory content) from the CSV file at `path`.
    /// A missing file loads as empty, matching a freshly created database.
    pub fn load(path: &Path) -> Result<Self> {
        let map = Self::new();
        if !path.exists() {
            return Ok(map);
        }

        let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
        for record in reader.records() {
            let record = record?;
            let key: i32 = record
                .get(0)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::Error::Invariant("malformed key map row".into()))?;
            let id: NodeId = record
                .get(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::Error::Invariant("malformed key map row".into()))?;
            map.add(key, id);
        }

        Ok(map)
    }
}
