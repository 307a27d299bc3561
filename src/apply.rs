// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Periodic binlog replay against a shadow index, atomically swapped into
//! place (C10).
//!
//! The periodic tick is a dedicated OS thread per database sleeping for the
//! configured apply interval, woken early on graceful shutdown via a
//! `stop_signal`-style flag, mirroring the donor's own stop-signal module.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::binlog::{self, Action, Binlog};
use crate::distance::Metric;
use crate::error::{Error, Result};
use crate::forest::Forest;
use crate::free_list::FreeList;
use crate::fs_util;
use crate::keymap::KeyMap;
use crate::meta::Meta;
use crate::node::Layout;
use crate::node_store::{FileNodeStore, NodeStore};
use crate::paths::DbPaths;
use crate::stop_signal::StopSignal;

/// Runs exactly one apply cycle against the database rooted at `live` using
/// `scratch_dir` as scratch space. Returns [`Error::TargetNotExist`] when
/// there is nothing to apply, mirroring the binlog's own non-fatal signal.
pub fn apply_once(live: &DbPaths, scratch_dir: &Path, binlog: &Binlog, metric: Metric) -> Result<()> {
    let cutoff = now_millis();

    if binlog.count(cutoff)? == 0 {
        return Err(Error::TargetNotExist);
    }

    std::fs::create_dir_all(scratch_dir)?;
    let scratch = DbPaths::new(scratch_dir, "shadow");

    std::fs::copy(&live.meta, &scratch.meta)?;
    std::fs::copy(&live.tree, &scratch.tree)?;
    std::fs::copy(&live.free, &scratch.free)?;
    if live.map.exists() {
        std::fs::copy(&live.map, &scratch.map)?;
    }

    let meta = Meta::open(&scratch.meta)?;
    let layout = Layout::new(meta.tree_count(), meta.dim(), meta.bucket_capacity());
    let store: Arc<dyn NodeStore> = Arc::new(FileNodeStore::open(&scratch.tree, layout)?);
    let free_list = Arc::new(FreeList::open(&scratch.free)?);
    let keymap = Arc::new(KeyMap::load(&scratch.map)?);
    let meta = Arc::new(meta);

    let forest = Forest::new(layout, metric, store, free_list, meta, keymap.clone());

    for entry in binlog.get(cutoff)? {
        match entry.action {
            Action::Update => {
                let v = binlog::decode_features(&entry.features)?;
                forest.update(entry.key, v)?;
            }
            Action::Delete => {
                if keymap.contains_key(entry.key) {
                    forest.remove(entry.key)?;
                }
            }
        }
    }

    forest.rebuild_all()?;
    keymap.save(&scratch.map)?;

    binlog.clear(cutoff)?;

    // Map file first: a crash between renames still leaves readers able to
    // resolve keys already present in the (possibly stale) live map, never
    // the reverse (IDs with no key).
    fs_util::rename_atomic(&scratch.map, &live.map)?;
    fs_util::rename_atomic(&scratch.meta, &live.meta)?;
    fs_util::rename_atomic(&scratch.tree, &live.tree)?;
    fs_util::rename_atomic(&scratch.free, &live.free)?;

    Ok(())
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Handle to the background apply-tick thread for one database.
pub struct ApplyEngine {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl ApplyEngine {
    /// Spawns the periodic thread. `scratch_dir` should be unique per
    /// database to avoid concurrent applies colliding on scratch filenames.
    #[must_use]
    pub fn spawn(
        live: DbPaths,
        scratch_dir: PathBuf,
        binlog: Arc<Binlog>,
        metric: Metric,
        interval: Duration,
    ) -> Self {
        let stop = StopSignal::new();
        let worker_stop = stop.clone();

        let handle = std::thread::spawn(move || {
            loop {
                if worker_stop.is_stopped() {
                    return;
                }

                match apply_once(&live, &scratch_dir, &binlog, metric) {
                    Ok(()) => log::info!("apply cycle completed"),
                    Err(Error::TargetNotExist) => {}
                    Err(e) => log::error!("apply cycle failed, will retry: {e}"),
                }

                sleep_or_wake(&worker_stop, interval);
            }
        });

        Self { stop, handle: Some(handle) }
    }

    pub fn shutdown(&mut self) {
        self.stop.set();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ApplyEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps in short slices so a stop request wakes the thread well before a
/// full tick elapses.
fn sleep_or_wake(stop: &StopSignal, interval: Duration) {
    const SLICE: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < interval {
        if stop.is_stopped() {
            return;
        }
        let step = SLICE.min(interval - waited);
        std::thread::sleep(step);
        waited += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::MetricKind;

    fn make_live_db(dir: &Path, name: &str) -> DbPaths {
        let paths = DbPaths::new(dir, name);
        let layout = Layout::new(1, 2, 4);
        Meta::create(&paths.meta, 1, 2, 4, MetricKind::Euclidean).expect("meta");
        FileNodeStore::open(&paths.tree, layout).expect("tree");
        FreeList::open(&paths.free).expect("free");
        paths
    }

    #[test]
    fn apply_once_reports_no_target_on_empty_binlog() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let live = make_live_db(dir.path(), "db");
        let binlog = Binlog::open(&live.bin).expect("binlog");

        let err = apply_once(&live, &dir.path().join("scratch"), &binlog, Metric::from(MetricKind::Euclidean))
            .expect_err("no target");
        assert!(matches!(err, Error::TargetNotExist));
    }

    #[test]
    fn apply_once_replays_update_then_delete() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let live = make_live_db(dir.path(), "db");
        let binlog = Binlog::open(&live.bin).expect("binlog");
        let metric = Metric::from(MetricKind::Euclidean);

        binlog.add(1, Action::Update, &binlog::encode_features(&[0.0, 0.0]), 100).expect("add");
        apply_once(&live, &dir.path().join("scratch"), &binlog, metric).expect("apply 1");

        let keymap = KeyMap::load(&live.map).expect("load map");
        assert!(keymap.contains_key(1));

        binlog.add(1, Action::Delete, &[], 200).expect("delete");
        apply_once(&live, &dir.path().join("scratch"), &binlog, metric).expect("apply 2");

        let keymap = KeyMap::load(&live.map).expect("load map");
        assert!(!keymap.contains_key(1));
    }
}
