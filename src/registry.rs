// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide directory of open databases (§9 redesign note: "top-level
//! server holds a mapping from database name to engine handle. Construct it
//! at startup; treat it as immutable afterward. Do not make it
//! reinitializable on signal.").
//!
//! The map from name to [`Database`] is built once, at startup, by scanning
//! `data_dir` for `*.meta` files and opening each. It is never replaced
//! wholesale afterward -- creating or dropping a database updates the same
//! map in place rather than swapping in a new one, so a signal handler (or
//! any other caller) can never observe a torn or stale registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::database::{CreateOptions, Database};
use crate::error::{Error, Result};

/// Shared handle to every open database under one `data_dir`.
pub struct DatabaseRegistry {
    data_dir: PathBuf,
    scratch_dir: PathBuf,
    databases: RwLock<HashMap<String, Database>>,
}

impl DatabaseRegistry {
    /// Opens every database found under `data_dir` (one per `*.meta` file).
    /// `scratch_dir` is shared scratch space for apply cycles; each
    /// database gets its own subdirectory under it.
    pub fn open(data_dir: &Path, scratch_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let mut databases = HashMap::new();

        for entry in std::fs::read_dir(data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let db = Database::open(data_dir, name)?;
            log::info!("registry: opened database {name}");
            databases.insert(name.to_string(), db);
        }

        Ok(Self { data_dir: data_dir.to_path_buf(), scratch_dir: scratch_dir.to_path_buf(), databases: RwLock::new(databases) })
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn scratch_for(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name)
    }

    /// Creates a new database and registers it. Fails if a database of
    /// that name is already registered or already exists on disk.
    pub fn create(&self, name: &str, options: CreateOptions) -> Result<Database> {
        let mut databases = self.databases.write().expect("lock is poisoned");
        if databases.contains_key(name) {
            return Err(Error::Invariant(format!("database {name} is already registered")));
        }

        let db = Database::create(&self.data_dir, name, options)?;
        databases.insert(name.to_string(), db.clone());
        Ok(db)
    }

    /// Looks up an already-registered database by name.
    pub fn get(&self, name: &str) -> Result<Database> {
        self.databases.read().expect("lock is poisoned").get(name).cloned().ok_or(Error::NotFound)
    }

    /// Names of every registered database, sorted for stable listing output.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().expect("lock is poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops a database: shuts down its background threads, removes it from
    /// the registry, then deletes its files from disk.
    pub fn drop_database(&self, name: &str, shutdown_timeout: std::time::Duration) -> Result<()> {
        let db = {
            let mut databases = self.databases.write().expect("lock is poisoned");
            databases.remove(name).ok_or(Error::NotFound)?
        };

        db.shutdown(shutdown_timeout);

        let paths = db.paths();
        for path in [&paths.meta, &paths.tree, &paths.map, &paths.free, &paths.bin] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Runs one apply cycle against `name`, using a per-database scratch
    /// subdirectory so concurrent applies across databases never collide.
    pub fn apply_once(&self, name: &str) -> Result<()> {
        let db = self.get(name)?;
        db.apply_once(&self.scratch_for(name))
    }

    /// Spawns the background apply thread for every registered database,
    /// per `interval`.
    pub fn spawn_apply_engines(&self, interval: std::time::Duration) {
        let databases = self.databases.read().expect("lock is poisoned");
        for (name, db) in databases.iter() {
            db.spawn_apply_engine(self.scratch_for(name), interval);
        }
    }

    /// Shuts down every registered database's background threads.
    pub fn shutdown_all(&self, timeout: std::time::Duration) {
        let databases = self.databases.read().expect("lock is poisoned");
        for db in databases.values() {
            db.shutdown(timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::MetricKind;

    #[test]
    fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let registry = DatabaseRegistry::open(dir.path(), &dir.path().join("scratch")).expect("registry");

        let options = CreateOptions { dim: 2, metric: MetricKind::Angular, tree_count: 1, bucket_capacity: 3 };
        registry.create("demo", options).expect("create");

        let db = registry.get("demo").expect("get");
        assert_eq!(db.dim(), 2);
        assert_eq!(registry.names(), vec!["demo".to_string()]);
    }

    #[test]
    fn open_rediscovers_existing_databases_on_restart() {
        let dir = tempfile::tempdir().expect("tmpdir");
        {
            let registry = DatabaseRegistry::open(dir.path(), &dir.path().join("scratch")).expect("registry");
            let options = CreateOptions { dim: 2, ..CreateOptions::default() };
            registry.create("demo", options).expect("create");
            registry.shutdown_all(std::time::Duration::from_secs(5));
        }

        let registry = DatabaseRegistry::open(dir.path(), &dir.path().join("scratch")).expect("reopen");
        assert_eq!(registry.names(), vec!["demo".to_string()]);
    }

    #[test]
    fn drop_database_removes_files_and_registry_entry() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let registry = DatabaseRegistry::open(dir.path(), &dir.path().join("scratch")).expect("registry");
        let options = CreateOptions { dim: 2, ..CreateOptions::default() };
        registry.create("demo", options).expect("create");

        registry.drop_database("demo", std::time::Duration::from_secs(5)).expect("drop");
        assert!(matches!(registry.get("demo"), Err(Error::NotFound)));
        assert!(!dir.path().join("demo.meta").exists());
    }
}
