// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Single-writer queue turning concurrent mutation requests into an ordered
//! stream (C8).
//!
//! Tree-node updates touch shared Meta and Free List state, so serializing
//! only at the key level would permit interleaved structural changes that
//! violate the one-leaf-per-key invariant. One OS thread per open database
//! drains a bounded `crossbeam_channel`, exactly mirroring the donor's
//! single dedicated worker per write path (one flush worker, one compaction
//! worker per tree) -- multiple databases each get their own independent
//! serializer thread, never a shared one.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::binlog::{self, Action, Binlog};
use crate::error::{Error, Result};
use crate::forest::Forest;
use crate::stop_signal::StopSignal;

/// Default bound on in-flight requests before `submit` starts blocking.
pub const QUEUE_CAPACITY: usize = 256;

/// Poll interval for checking the stop signal between channel receives.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum Mutation {
    Add(i32, Vec<f64>),
    Remove(i32),
    Update(i32, Vec<f64>),
}

struct Request {
    mutation: Mutation,
    reply: mpsc::Sender<Result<()>>,
}

/// Handle to a running serializer thread. Dropping it does not stop the
/// thread -- call [`Self::shutdown`] for a clean stop.
pub struct Serializer {
    sender: Sender<Request>,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Serializer {
    /// Spawns the dedicated worker thread. Every mutation on `forest` (and,
    /// when `binlog` is set, the matching binlog append) is run from that
    /// single thread in arrival order.
    #[must_use]
    pub fn spawn(forest: std::sync::Arc<Forest>, binlog: Option<std::sync::Arc<Binlog>>) -> Self {
        let (sender, receiver): (Sender<Request>, Receiver<Request>) = bounded(QUEUE_CAPACITY);
        let stop = StopSignal::new();
        let worker_stop = stop.clone();

        let handle = std::thread::spawn(move || run(forest, binlog, receiver, worker_stop));

        Self { sender, stop, handle: Some(handle) }
    }

    /// Enqueues a mutation and blocks until the worker thread applies it,
    /// returning its result. Errors from a full queue are surfaced as
    /// [`Error::Invariant`] rather than blocking forever on a stopped
    /// worker.
    pub fn submit(&self, mutation: Mutation) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = Request { mutation, reply: reply_tx };

        match self.sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                self.sender
                    .send(request)
                    .map_err(|_| Error::Invariant("serializer thread has stopped".into()))?;
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::Invariant("serializer thread has stopped".into()))
            }
        }

        reply_rx
            .recv()
            .map_err(|_| Error::Invariant("serializer thread dropped the reply channel".into()))?
    }

    /// Signals the worker to stop after draining in-flight requests and
    /// joins it.
    pub fn shutdown(&mut self) {
        self.stop.set();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Serializer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(forest: std::sync::Arc<Forest>, binlog: Option<std::sync::Arc<Binlog>>, receiver: Receiver<Request>, stop: StopSignal) {
    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(request) => {
                let result = apply(&forest, binlog.as_deref(), &request.mutation);
                let _ = request.reply.send(result);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stop.is_stopped() && receiver.is_empty() {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn apply(forest: &Forest, binlog: Option<&Binlog>, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::Add(key, v) => {
            forest.add(*key, v.clone())?;
            if let Some(log) = binlog {
                log.add(*key, Action::Update, &binlog::encode_features(v), now_millis())?;
            }
            Ok(())
        }
        Mutation::Remove(key) => {
            forest.remove(*key)?;
            if let Some(log) = binlog {
                log.add(*key, Action::Delete, &[], now_millis())?;
            }
            Ok(())
        }
        Mutation::Update(key, v) => {
            forest.update(*key, v.clone())?;
            if let Some(log) = binlog {
                log.add(*key, Action::Update, &binlog::encode_features(v), now_millis())?;
            }
            Ok(())
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Metric, MetricKind};
    use crate::free_list::FreeList;
    use crate::keymap::KeyMap;
    use crate::meta::Meta;
    use crate::node::Layout;
    use crate::node_store::{FileNodeStore, NodeStore};
    use std::sync::Arc;

    fn test_forest(dir: &std::path::Path) -> Arc<Forest> {
        let layout = Layout::new(2, 2, 4);
        let store: Arc<dyn NodeStore> =
            Arc::new(FileNodeStore::open(&dir.join("db.tree"), layout).expect("store"));
        let free_list = Arc::new(FreeList::open(&dir.join("db.free")).expect("free_list"));
        let meta = Arc::new(Meta::create(&dir.join("db.meta"), 2, 2, 4, MetricKind::Euclidean).expect("meta"));
        let keymap = Arc::new(KeyMap::new());
        Arc::new(Forest::with_seed(
            layout,
            Metric::from(MetricKind::Euclidean),
            store,
            free_list,
            meta,
            keymap,
            7,
        ))
    }

    #[test]
    fn submit_applies_mutations_in_order_on_one_thread() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let forest = test_forest(dir.path());

        let mut serializer = Serializer::spawn(forest.clone(), None);

        serializer.submit(Mutation::Add(1, vec![0.0, 0.0])).expect("add 1");
        serializer.submit(Mutation::Add(2, vec![1.0, 1.0])).expect("add 2");
        serializer.submit(Mutation::Update(1, vec![2.0, 2.0])).expect("update 1");

        assert_eq!(forest.keymap().len(), 2);
        serializer.submit(Mutation::Remove(2)).expect("remove 2");
        assert_eq!(forest.keymap().len(), 1);

        serializer.shutdown();
    }

    #[test]
    fn submit_records_binlog_rows_when_attached() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let forest = test_forest(dir.path());
        let binlog = Arc::new(Binlog::open(&dir.path().join("db.binlog")).expect("binlog"));

        let mut serializer = Serializer::spawn(forest, Some(binlog.clone()));
        serializer.submit(Mutation::Add(1, vec![0.0, 0.0])).expect("add");
        serializer.shutdown();

        assert_eq!(binlog.count(i64::MAX).expect("count"), 1);
    }
}
