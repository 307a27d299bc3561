// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The per-database facade: ties Node Store, Free List, Key↔ID Map, Meta,
//! Forest, Mutation Serializer, Binlog, and Apply Engine together behind one
//! handle, the way the donor's `Tree` wraps its memtable/levels/descriptor
//! table behind one clonable handle.
//!
//! Two ingestion paths are exposed, matching §2's "data flow" paragraph and
//! its closing sentence about a direct online mode:
//!
//! - [`Database::put`]/[`Database::delete`] only append to the Binlog; the
//!   change is not visible to search until an apply cycle ([`Database::apply_once`]
//!   or the background [`ApplyEngine`]) replays it into a freshly rebuilt
//!   snapshot and swaps it into place. This is the path the HTTP adapter's
//!   `PUT`/`DELETE` routes drive (§6), and the one testable property
//!   8/E5 describe ("binlog content not visible until Apply").
//! - [`Database::put_online`]/[`Database::delete_online`] mutate the live
//!   forest immediately through the Mutation Serializer, for callers that
//!   need low-latency visibility and can tolerate a less balanced forest
//!   between apply cycles.
//!
//! Mixing both paths for the same database is safe but redundant: a
//! direct-mode write is idempotently replayed by the next apply cycle
//! (`forest.update` tolerates re-adding an already-live key because it
//! removes first) since Apply always starts from a fresh copy of whatever
//! is live at cutoff time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::apply::{self, ApplyEngine};
use crate::binlog::{Action, Binlog};
use crate::distance::{Metric, MetricKind};
use crate::error::{Error, Result};
use crate::forest::Forest;
use crate::free_list::FreeList;
use crate::keymap::KeyMap;
use crate::meta::Meta;
use crate::node::Layout;
use crate::node_store::{FileNodeStore, NodeStore};
use crate::paths::DbPaths;
use crate::search::{self, SearchHandle, SearchIndex};
use crate::serializer::{Mutation, Serializer};

/// Parameters needed to create a brand-new database (mirrors the CLI's
/// `create --dim --distance --object --path` surface, §6).
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub dim: usize,
    pub metric: MetricKind,
    pub tree_count: usize,
    pub bucket_capacity: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { dim: 0, metric: MetricKind::Angular, tree_count: 50, bucket_capacity: 10 }
    }
}

/// Everything an apply cycle's file-rename can invalidate: reopened and
/// swapped in as a unit by [`Database::reload`], never mutated field by
/// field, so concurrent readers see either the pre- or post-apply state in
/// full, the same "rename is atomic" guarantee §4.10 asks of the files
/// themselves.
struct Inner {
    store: Arc<dyn NodeStore>,
    meta: Arc<Meta>,
    keymap: Arc<KeyMap>,
    free_list: Arc<FreeList>,
    forest: Arc<Forest>,
    serializer: Serializer,
}

impl Inner {
    fn open(paths: &DbPaths, layout: Layout, metric: Metric, binlog: Option<Arc<Binlog>>) -> Result<Self> {
        let meta = Arc::new(Meta::open(&paths.meta)?);
        let store: Arc<dyn NodeStore> = Arc::new(FileNodeStore::open(&paths.tree, layout)?);
        let free_list = Arc::new(FreeList::open(&paths.free)?);
        let keymap = Arc::new(KeyMap::load(&paths.map)?);

        let forest = Arc::new(Forest::new(layout, metric, store.clone(), free_list.clone(), meta.clone(), keymap.clone()));
        let serializer = Serializer::spawn(forest.clone(), binlog);

        Ok(Self { store, meta, keymap, free_list, forest, serializer })
    }
}

/// One open database: the live files plus the background serializer and
/// apply threads that keep them durable and queryable concurrently.
///
/// Cloning is cheap -- it shares the same underlying handles, the way the
/// donor's `Tree` is a clonable `Arc` wrapper, so multiple request handlers
/// can hold a `Database` without synchronizing on a registry lock per call.
#[derive(Clone)]
pub struct Database {
    name: String,
    layout: Layout,
    metric: Metric,
    binlog: Arc<Binlog>,
    inner: Arc<RwLock<Inner>>,
    apply_engine: Arc<std::sync::Mutex<Option<ApplyEngine>>>,
    paths: DbPaths,
}

impl Database {
    /// Creates a brand-new database under `dir/<name>.*`. Fails if any of
    /// the database's files already exist there.
    pub fn create(dir: &Path, name: &str, options: CreateOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let paths = DbPaths::new(dir, name);
        if paths.exists() {
            return Err(Error::Invariant(format!("database {name} already exists at {dir:?}")));
        }

        let meta = Meta::create(&paths.meta, options.tree_count, options.dim, options.bucket_capacity, options.metric)?;
        let layout = Layout::new(options.tree_count, options.dim, options.bucket_capacity);
        FileNodeStore::open(&paths.tree, layout)?;
        FreeList::open(&paths.free)?;
        Binlog::open(&paths.bin)?;
        KeyMap::new().save(&paths.map)?;

        drop(meta);
        Self::open(dir, name)
    }

    /// Opens an existing database, wiring its live files to fresh in-memory
    /// handles and spawning its Mutation Serializer (bound to this
    /// database's Binlog, so [`Self::put_online`]/[`Self::delete_online`]
    /// are also durably logged).
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let paths = DbPaths::new(dir, name);
        if !paths.exists() {
            return Err(Error::NotFound);
        }

        let meta = Meta::open(&paths.meta)?;
        let layout = Layout::new(meta.tree_count(), meta.dim(), meta.bucket_capacity());
        let metric = Metric::from(meta.metric());
        drop(meta);

        let binlog = Arc::new(Binlog::open(&paths.bin)?);
        let inner = Inner::open(&paths, layout, metric, Some(binlog.clone()))?;

        Ok(Self {
            name: name.to_string(),
            layout,
            metric,
            binlog,
            inner: Arc::new(RwLock::new(inner)),
            apply_engine: Arc::new(std::sync::Mutex::new(None)),
            paths,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.layout.dim
    }

    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.layout.tree_count
    }

    /// Number of live (non-tombstoned) items visible to search right now
    /// (i.e. as of the last apply cycle, not counting pending binlog rows).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock is poisoned").keymap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now_millis() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Appends an `UPDATE` row to the Binlog. Not visible to search until
    /// an apply cycle replays it (§4.9, testable property 8, scenario E5).
    /// This is the path the HTTP `PUT` adapter drives.
    pub fn put(&self, key: i32, v: Vec<f64>) -> Result<()> {
        if v.len() != self.layout.dim {
            return Err(Error::Invariant(format!("vector has {} dims, expected {}", v.len(), self.layout.dim)));
        }
        self.binlog.add(key, Action::Update, &crate::binlog::encode_features(&v), Self::now_millis())
    }

    /// Appends a `DELETE` row to the Binlog. Not visible to search until an
    /// apply cycle replays it.
    pub fn delete(&self, key: i32) -> Result<()> {
        self.binlog.add(key, Action::Delete, &[], Self::now_millis())
    }

    /// Mutates the live forest immediately through the Mutation Serializer
    /// (the "direct online mode" of §2/§4.7), still durably logged to the
    /// Binlog so a later apply cycle can rebuild a better-balanced forest
    /// from the same history.
    pub fn put_online(&self, key: i32, v: Vec<f64>) -> Result<()> {
        if v.len() != self.layout.dim {
            return Err(Error::Invariant(format!("vector has {} dims, expected {}", v.len(), self.layout.dim)));
        }
        self.inner.read().expect("lock is poisoned").serializer.submit(Mutation::Update(key, v))
    }

    /// Direct online-mode counterpart to [`Self::delete`].
    pub fn delete_online(&self, key: i32) -> Result<()> {
        self.inner.read().expect("lock is poisoned").serializer.submit(Mutation::Remove(key))
    }

    /// `search(v, n, search_k)`, translated to external keys.
    pub fn search(&self, query: &[f64], limit: usize, search_k: Option<usize>) -> Result<Vec<i32>> {
        let inner = self.inner.read().expect("lock is poisoned");
        let index = SearchIndex { store: inner.store.as_ref(), meta: inner.meta.as_ref(), metric: &self.metric };
        let ids = search::search(&index, query, limit, search_k)?;
        ids.into_iter().map(|id| inner.keymap.key_from_id(id)).collect()
    }

    /// `search_item(key, limit, epsilon)`: the HTTP `GET /search` handler's
    /// synchronous call, no deadline.
    pub fn search_item(&self, key: i32, limit: usize, search_k: Option<usize>) -> Result<Vec<i32>> {
        let inner = self.inner.read().expect("lock is poisoned");
        let index = SearchIndex { store: inner.store.as_ref(), meta: inner.meta.as_ref(), metric: &self.metric };
        search::search_item(&index, &inner.keymap, key, limit, search_k)
    }

    /// Same as [`Self::search_item`], raced against `deadline` on a worker
    /// thread per §4.11 / §9's deadline-bounded search redesign note.
    pub fn search_item_with_deadline(&self, key: i32, limit: usize, search_k: Option<usize>, deadline: Duration) -> Result<Vec<i32>> {
        let inner = self.inner.read().expect("lock is poisoned");
        let handle = Arc::new(SearchHandle {
            store: inner.store.clone(),
            meta: inner.meta.clone(),
            metric: self.metric,
            keymap: inner.keymap.clone(),
        });
        drop(inner);
        search::search_item_with_deadline(handle, key, limit, search_k, deadline)
    }

    /// Runs exactly one apply cycle synchronously (the CLI `apply` command,
    /// or a manual savepoint trigger), then reopens this handle's live
    /// state against the swapped-in files. Returns `Ok(())` even when there
    /// was nothing to apply: [`Error::TargetNotExist`] is swallowed here
    /// since callers of this method expect "apply ran, possibly a no-op",
    /// while the background [`ApplyEngine`] loop distinguishes the two for
    /// its own logging.
    pub fn apply_once(&self, scratch_dir: &Path) -> Result<()> {
        match apply::apply_once(&self.paths, scratch_dir, &self.binlog, self.metric) {
            Ok(()) => self.reload(),
            Err(Error::TargetNotExist) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reopens every live handle against the current on-disk files and
    /// swaps them in as one unit, stopping the old Mutation Serializer
    /// first so no in-flight direct-mode mutation is lost mid-swap.
    ///
    /// Required after any out-of-band rename of the live files (a manual
    /// `apply_once` call, or the background [`ApplyEngine`] thread): a
    /// [`crate::node_store::FileNodeStore`]'s open file descriptor keeps
    /// addressing the old inode after `rename(2)` replaces the path, so
    /// without this the handle would silently keep reading the pre-apply
    /// snapshot forever.
    fn reload(&self) -> Result<()> {
        let fresh = Inner::open(&self.paths, self.layout, self.metric, Some(self.binlog.clone()))?;
        let mut guard = self.inner.write().expect("lock is poisoned");
        let mut old = std::mem::replace(&mut *guard, fresh);
        drop(guard);
        old.serializer.shutdown();
        Ok(())
    }

    /// Spawns the periodic background apply thread for this database.
    /// Idempotent: a second call stops the previous thread before spawning
    /// a new one.
    ///
    /// Note the background thread calls [`apply::apply_once`] directly (not
    /// [`Self::apply_once`]) and cannot itself call [`Self::reload`] on this
    /// handle -- callers that run the background engine are expected to
    /// periodically call [`Self::reload`] themselves (e.g. before serving a
    /// search request, or on a matching timer) to observe swapped-in files.
    pub fn spawn_apply_engine(&self, scratch_dir: PathBuf, interval: Duration) {
        let mut guard = self.apply_engine.lock().expect("lock is poisoned");
        if let Some(mut old) = guard.take() {
            old.shutdown();
        }
        *guard = Some(ApplyEngine::spawn(self.paths.clone(), scratch_dir, self.binlog.clone(), self.metric, interval));
    }

    /// Stops the live Mutation Serializer and (if running) the background
    /// apply thread, waiting up to `timeout` for in-flight work -- mirroring
    /// the donor's graceful-shutdown contract (§5): exceeding it drops
    /// pending work rather than blocking forever.
    pub fn shutdown(&self, timeout: Duration) {
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = self.inner.clone();
        let apply_engine = self.apply_engine.clone();

        std::thread::spawn(move || {
            inner.write().expect("lock is poisoned").serializer.shutdown();
            if let Some(engine) = apply_engine.lock().expect("lock is poisoned").as_mut() {
                engine.shutdown();
            }
            let _ = tx.send(());
        });

        if rx.recv_timeout(timeout).is_err() {
            log::warn!("database {} did not shut down within {timeout:?}; pending work dropped", self.name);
        }
    }

    /// Atomically overwrites the on-disk Key↔ID Map with the current
    /// in-memory contents (the "savepoint" the HTTP adapter schedules
    /// asynchronously via `PUT /savepoints`).
    pub fn save_keymap(&self) -> Result<()> {
        self.inner.read().expect("lock is poisoned").keymap.save(&self.paths.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_round_trips_dimensionality() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 2, bucket_capacity: 4 };
        let db = Database::create(dir.path(), "demo", options).expect("create");
        assert_eq!(db.dim(), 3);
        assert_eq!(db.tree_count(), 2);
        assert!(db.is_empty());

        let reopened = Database::open(dir.path(), "demo").expect("open");
        assert_eq!(reopened.dim(), 3);
    }

    #[test]
    fn create_fails_when_database_already_exists() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 2, ..CreateOptions::default() };
        Database::create(dir.path(), "demo", options).expect("first create");

        let err = Database::create(dir.path(), "demo", options).expect_err("second create");
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn put_online_then_search_item_returns_self_first() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 1, bucket_capacity: 3 };
        let db = Database::create(dir.path(), "demo", options).expect("create");

        db.put_online(0, vec![0.1, 0.1, 0.0]).expect("put 0");
        db.put_online(1, vec![0.1, 0.1, 0.1]).expect("put 1");
        db.put_online(2, vec![0.5, 0.5, 0.1]).expect("put 2");

        let result = db.search_item(0, 2, None).expect("search");
        assert_eq!(result[0], 0);
        assert!(result.contains(&1));

        db.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn delete_online_then_search_item_is_not_found() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 2, metric: MetricKind::Euclidean, tree_count: 1, bucket_capacity: 3 };
        let db = Database::create(dir.path(), "demo", options).expect("create");

        db.put_online(1, vec![0.0, 0.0]).expect("put");
        db.delete_online(1).expect("delete");

        let err = db.search_item(1, 1, None).expect_err("not found");
        assert!(matches!(err, Error::NotFound));

        db.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn put_is_not_visible_until_apply_runs() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 2, metric: MetricKind::Euclidean, tree_count: 1, bucket_capacity: 3 };
        let db = Database::create(dir.path(), "demo", options).expect("create");

        db.put(1, vec![0.0, 0.0]).expect("put");
        assert!(matches!(db.search_item(1, 1, None), Err(Error::NotFound)));

        db.apply_once(&dir.path().join("scratch")).expect("apply");
        assert_eq!(db.search_item(1, 1, None).expect("search"), vec![1]);

        db.delete(1).expect("delete");
        assert_eq!(db.search_item(1, 1, None).expect("still live pre-apply"), vec![1]);

        db.apply_once(&dir.path().join("scratch")).expect("apply 2");
        assert!(matches!(db.search_item(1, 1, None), Err(Error::NotFound)));

        db.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn apply_once_with_nothing_pending_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let options = CreateOptions { dim: 2, ..CreateOptions::default() };
        let db = Database::create(dir.path(), "demo", options).expect("create");

        db.apply_once(&dir.path().join("scratch")).expect("apply");
        db.shutdown(Duration::from_secs(5));
    }
}
