// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Best-first cross-tree traversal, dedup, and top-N scoring, raced against
//! a deadline (C11).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::distance::{DistancePolicy, Metric};
use crate::error::{Error, Result};
use crate::keymap::KeyMap;
use crate::meta::Meta;
use crate::node::{NodeBody, NodeId, NONE};
use crate::node_store::NodeStore;

/// A priority-queue entry: `priority` is the tightest margin seen so far
/// along the path to `node`, `+infinity` for tree roots.
struct Entry {
    priority: f64,
    node: NodeId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.partial_cmp(&other.priority).unwrap_or(Ordering::Equal)
    }
}

/// Read-only view the executor needs: a node store, the forest roots, and
/// the configured metric. Borrowed rather than owned so it can run against
/// either a live database or (for tests) a bare in-memory setup.
pub struct SearchIndex<'a> {
    pub store: &'a dyn NodeStore,
    pub meta: &'a Meta,
    pub metric: &'a Metric,
}

/// `search_k = -1` (None here) defaults to `n * tree_count`.
pub fn search(index: &SearchIndex<'_>, query: &[f64], n: usize, search_k: Option<usize>) -> Result<Vec<NodeId>> {
    let search_k = search_k.unwrap_or_else(|| n * index.meta.tree_count().max(1));
    let bucket_capacity = index.meta.bucket_capacity();

    let mut heap = BinaryHeap::new();
    for &root in &index.meta.roots()? {
        if root != NONE {
            heap.push(Entry { priority: f64::INFINITY, node: root });
        }
    }

    let mut collected: Vec<NodeId> = Vec::new();

    while collected.len() < search_k {
        let Some(Entry { priority, node }) = heap.pop() else { break };
        let decoded = index.store.find(node)?;
        if decoded.free {
            continue;
        }

        match &decoded.body {
            NodeBody::Leaf { .. } => collected.push(node),
            NodeBody::Bucket { children } if children.len() <= bucket_capacity => {
                collected.extend(children.iter().copied());
            }
            NodeBody::Bucket { children } => {
                return Err(Error::Invariant(format!(
                    "bucket node {node} has {} children, capacity is {bucket_capacity}",
                    children.len()
                )))
            }
            NodeBody::Split { children, v: plane } => {
                let m = index.metric.margin(plane, query);
                heap.push(Entry { priority: priority.min(m), node: children[1] });
                heap.push(Entry { priority: priority.min(-m), node: children[0] });
            }
        }
    }

    collected.sort_unstable();
    collected.dedup();

    let mut scored: Vec<(f64, NodeId)> = Vec::with_capacity(collected.len());
    for id in collected {
        let leaf = index.store.find(id)?;
        if leaf.free {
            continue;
        }
        match leaf.body {
            NodeBody::Leaf { v } => scored.push((index.metric.distance(&v, query), id)),
            _ => {
                return Err(Error::Invariant(format!(
                    "collected id {id} is not a leaf"
                )))
            }
        }
    }

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    let take = n.min(scored.len());
    Ok(scored.into_iter().take(take).map(|(_, id)| id).collect())
}

/// Looks `key` up via the Key↔ID Map, retrieves its vector, and delegates to
/// [`search`], translating result node IDs back to external keys.
pub fn search_item(
    index: &SearchIndex<'_>,
    keymap: &KeyMap,
    key: i32,
    limit: usize,
    search_k: Option<usize>,
) -> Result<Vec<i32>> {
    let id = keymap.id_from_key(key)?;
    let query = match index.store.find(id)?.body {
        NodeBody::Leaf { v } => v,
        _ => return Err(Error::Invariant(format!("key {key} does not map to a leaf"))),
    };

    let ids = search(index, &query, limit, search_k)?;
    ids.into_iter().map(|id| keymap.key_from_id(id)).collect()
}

/// Shared, thread-safe handle bundling the collaborators `search_item_with_deadline`
/// needs to run on a worker thread.
pub struct SearchHandle {
    pub store: Arc<dyn NodeStore>,
    pub meta: Arc<Meta>,
    pub metric: Metric,
    pub keymap: Arc<KeyMap>,
}

impl SearchHandle {
    fn index(&self) -> SearchIndex<'_> {
        SearchIndex { store: self.store.as_ref(), meta: self.meta.as_ref(), metric: &self.metric }
    }
}

/// Runs `search_item` on a worker thread and races it against `deadline`.
/// On expiry returns [`Error::Timeout`]; the worker's eventual result (if
/// any) is simply dropped -- there is no cooperative cancellation of the
/// underlying traversal.
pub fn search_item_with_deadline(
    handle: Arc<SearchHandle>,
    key: i32,
    limit: usize,
    search_k: Option<usize>,
    deadline: Duration,
) -> Result<Vec<i32>> {
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = search_item(&handle.index(), &handle.keymap, key, limit, search_k);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout | mpsc::RecvTimeoutError::Disconnected) => Err(Error::Timeout),
    }
}
