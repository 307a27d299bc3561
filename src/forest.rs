// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Build/search/insert/remove across the forest; partitions work per tree
//! (C7). This is the component the Mutation Serializer (C8) drives.

use std::sync::{Arc, Mutex};

use rand::{RngCore, SeedableRng};

use crate::{
    distance::{DistancePolicy, Metric},
    error::{Error, Result},
    free_list::{self, FreeList},
    keymap::KeyMap,
    meta::Meta,
    node::{Layout, Node, NodeBody, NodeId, NONE},
    node_store::NodeStore,
};

enum RngSource {
    /// Each caller draws from its own thread-local generator.
    ThreadLocal,
    /// A single seeded generator shared (and mutex-serialized) for
    /// reproducible tests.
    Seeded(Mutex<rand::rngs::StdRng>),
}

/// Holds `T` trees over the same item set and runs Add/Remove/Update against
/// a Node Store, Free List, Meta File, and Key↔ID Map.
///
/// All four collaborators are injected so the same engine logic can run
/// against either a live database or an Apply Engine shadow copy.
pub struct Forest {
    layout: Layout,
    metric: Metric,
    store: Arc<dyn NodeStore>,
    free_list: Arc<FreeList>,
    meta: Arc<Meta>,
    keymap: Arc<KeyMap>,
    rng: RngSource,
}

impl Forest {
    #[must_use]
    pub fn new(
        layout: Layout,
        metric: Metric,
        store: Arc<dyn NodeStore>,
        free_list: Arc<FreeList>,
        meta: Arc<Meta>,
        keymap: Arc<KeyMap>,
    ) -> Self {
        Self { layout, metric, store, free_list, meta, keymap, rng: RngSource::ThreadLocal }
    }

    /// Builds a forest with a deterministic RNG seed. Used by property and
    /// boundary tests that assert on the canonical split orientation.
    #[must_use]
    pub fn with_seed(
        layout: Layout,
        metric: Metric,
        store: Arc<dyn NodeStore>,
        free_list: Arc<FreeList>,
        meta: Arc<Meta>,
        keymap: Arc<KeyMap>,
        seed: u64,
    ) -> Self {
        Self {
            layout,
            metric,
            store,
            free_list,
            meta,
            keymap,
            rng: RngSource::Seeded(Mutex::new(rand::rngs::StdRng::seed_from_u64(seed))),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<Meta> {
        &self.meta
    }

    #[must_use]
    pub fn keymap(&self) -> &Arc<KeyMap> {
        &self.keymap
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut dyn RngCore) -> T) -> T {
        match &self.rng {
            RngSource::ThreadLocal => {
                let mut rng = rand::thread_rng();
                f(&mut rng)
            }
            RngSource::Seeded(mutex) => {
                let mut guard = mutex.lock().expect("lock is poisoned");
                f(&mut *guard)
            }
        }
    }

    /// Bounded by `min(tree_count, host CPUs)` per the resolved Open
    /// Question in §9 -- never a fixed pool of three.
    fn worker_pool_size(&self) -> usize {
        self.layout.tree_count.min(num_cpus::get()).max(1)
    }

    fn chunk_trees(&self) -> Vec<Vec<usize>> {
        let pool = self.worker_pool_size();
        let mut chunks = vec![Vec::new(); pool];
        for t in 0..self.layout.tree_count {
            chunks[t % pool].push(t);
        }
        chunks
    }

    fn destroy(&self, id: NodeId) -> Result<()> {
        self.store.delete(id)?;
        self.free_list.push(id)
    }

    fn allocate(&self, node: &Node) -> Result<NodeId> {
        free_list::allocate(&self.free_list, self.store.as_ref(), node)
    }

    /// Walks `parents[tree_index]` from `start` up to the tree's root,
    /// adjusting every ancestor split node's `n_descendants` by `delta`.
    /// `start` is itself the first node adjusted; `NONE` is a no-op. Add and
    /// Remove only rewrite the immediate host/parent directly, so every node
    /// above it on the path to the root also gained or lost exactly one leaf
    /// (§3 invariant 3).
    fn propagate_n_descendants(&self, tree_index: usize, start: NodeId, delta: i32) -> Result<()> {
        let mut current = start;
        while current != NONE {
            let node = self.store.find(current)?;
            let mut updated = node.clone();
            updated.n_descendants += delta;
            self.store.update(current, &updated)?;
            current = node.parents[tree_index];
        }
        Ok(())
    }

    fn leaf_vector(&self, id: NodeId) -> Result<Vec<f64>> {
        match self.store.find(id)?.body {
            NodeBody::Leaf { v } => Ok(v),
            _ => Err(Error::Invariant(format!("node {id} is not a leaf"))),
        }
    }

    /// Inserts a new item. Fails with [`Error::Invariant`] if `key` already
    /// has an entry -- use [`Self::update`] to replace an existing key.
    pub fn add(&self, key: i32, v: Vec<f64>) -> Result<()> {
        if v.len() != self.layout.dim {
            return Err(Error::Invariant(format!(
                "vector has {} dims, expected {}",
                v.len(),
                self.layout.dim
            )));
        }
        if self.keymap.contains_key(key) {
            return Err(Error::Invariant(format!("key {key} already exists")));
        }

        let leaf = Node::new_leaf(key, v, self.layout.tree_count);
        let leaf_id = self.allocate(&leaf)?;

        let chunks = self.chunk_trees();
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .map(|chunk| {
                    scope.spawn(|| {
                        self.with_rng(|rng| {
                            let mut first_err = None;
                            for &t in chunk {
                                if let Err(e) = self.add_to_tree(t, leaf_id, rng) {
                                    log::warn!("add: tree {t} failed for key {key}: {e}");
                                    first_err.get_or_insert(e);
                                }
                            }
                            first_err.map_or(Ok(()), Err)
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker panicked")).collect()
        });

        for r in results {
            r?;
        }

        self.keymap.add(key, leaf_id);
        Ok(())
    }

    fn add_to_tree(&self, tree_index: usize, leaf_id: NodeId, rng: &mut dyn RngCore) -> Result<()> {
        let root = self.meta.roots()?[tree_index];

        if root == NONE {
            self.meta.update_root(tree_index, leaf_id)?;
            return Ok(());
        }

        let (host_id, host) = self.descend_to_host(root, &self.leaf_vector(leaf_id)?, rng)?;
        let parent_of_host = host.parents[tree_index];

        match &host.body {
            NodeBody::Bucket { children } if children.len() < self.layout.bucket_capacity => {
                let mut new_children = children.clone();
                new_children.push(leaf_id);

                let mut updated = host.clone();
                updated.n_descendants = i32::try_from(new_children.len()).unwrap_or(i32::MAX);
                updated.body = NodeBody::Bucket { children: new_children };

                self.store.update(host_id, &updated)?;
                self.store.update_parent(leaf_id, tree_index, host_id)?;
                self.propagate_n_descendants(tree_index, parent_of_host, 1)
            }
            NodeBody::Bucket { children } => {
                let mut ids = children.clone();
                ids.push(leaf_id);

                let subtree_id = self.make_tree(tree_index, parent_of_host, &ids, rng)?;
                self.attach_subtree(tree_index, parent_of_host, host_id, subtree_id)?;
                self.propagate_n_descendants(tree_index, parent_of_host, 1)?;
                self.destroy(host_id)
            }
            NodeBody::Leaf { .. } => {
                let subtree_id = self.make_tree(tree_index, parent_of_host, &[host_id, leaf_id], rng)?;
                self.attach_subtree(tree_index, parent_of_host, host_id, subtree_id)?;
                self.propagate_n_descendants(tree_index, parent_of_host, 1)
            }
            NodeBody::Split { .. } => Err(Error::Invariant(
                "descent stopped on a split node; traversal bug".into(),
            )),
        }
    }

    /// Descends from `root` by repeatedly choosing a side, stopping at the
    /// first leaf or bucket.
    fn descend_to_host(&self, root: NodeId, v: &[f64], rng: &mut dyn RngCore) -> Result<(NodeId, Node)> {
        let mut current_id = root;
        loop {
            let current = self.store.find(current_id)?;
            match &current.body {
                NodeBody::Split { children, v: plane } => {
                    let side = self.metric.side(plane, v, rng);
                    current_id = children[side as usize];
                }
                NodeBody::Leaf { .. } | NodeBody::Bucket { .. } => return Ok((current_id, current)),
            }
        }
    }

    fn attach_subtree(
        &self,
        tree_index: usize,
        parent_of_host: NodeId,
        old_host_id: NodeId,
        new_subtree_id: NodeId,
    ) -> Result<()> {
        if parent_of_host == NONE {
            self.meta.update_root(tree_index, new_subtree_id)?;
            self.store.update_parent(new_subtree_id, tree_index, NONE)?;
            Ok(())
        } else {
            self.replace_child(parent_of_host, tree_index, old_host_id, new_subtree_id)
        }
    }

    /// Replaces `old_child` with `new_child` in `parent`'s children and
    /// re-points `new_child`'s parent slot. Per the redesign notes, parent
    /// pointers may be transiently stale within one mutation window, so a
    /// failed match is retried once before surfacing as an invariant error.
    fn replace_child(
        &self,
        parent_id: NodeId,
        tree_index: usize,
        old_child: NodeId,
        new_child: NodeId,
    ) -> Result<()> {
        for attempt in 0..2 {
            let parent = self.store.find(parent_id)?;
            let children = parent.body.children();

            if let Some(pos) = children.iter().position(|&c| c == old_child) {
                let mut updated = parent.clone();
                match &mut updated.body {
                    NodeBody::Bucket { children } => children[pos] = new_child,
                    NodeBody::Split { children, .. } => children[pos] = new_child,
                    NodeBody::Leaf { .. } => {
                        return Err(Error::Invariant("leaf cannot be a parent".into()))
                    }
                }
                self.store.update(parent_id, &updated)?;
                self.store.update_parent(new_child, tree_index, parent_id)?;
                return Ok(());
            }

            if attempt == 0 {
                continue;
            }
        }

        Err(Error::Invariant(format!(
            "parent {parent_id} does not list child {old_child} (stale pointer)"
        )))
    }

    /// Recursive bottom-up builder (§4.7 `make_tree`). `ids` must be leaf
    /// IDs. Returns the ID of the subtree root, whose `parents[tree_index]`
    /// has been set to `parent`.
    fn make_tree(&self, tree_index: usize, parent: NodeId, ids: &[NodeId], rng: &mut dyn RngCore) -> Result<NodeId> {
        if ids.len() == 1 {
            self.store.update_parent(ids[0], tree_index, parent)?;
            return Ok(ids[0]);
        }

        if ids.len() <= self.layout.bucket_capacity {
            let mut node = Node::new_bucket(ids.to_vec(), self.layout.tree_count);
            node.parents[tree_index] = parent;
            let bucket_id = self.allocate(&node)?;
            for &child in ids {
                self.store.update_parent(child, tree_index, bucket_id)?;
            }
            return Ok(bucket_id);
        }

        let vectors: Vec<Vec<f64>> =
            ids.iter().map(|&id| self.leaf_vector(id)).collect::<Result<_>>()?;

        let mut plane = self.metric.create_split(&vectors, self.layout.dim, rng);
        let mut left_right = partition(ids, &vectors, &plane, &self.metric, rng);

        if left_right.0.is_empty() || left_right.1.is_empty() {
            // Degenerate split: reset the hyperplane and flip children
            // uniformly at random until both sides are non-empty.
            plane = vec![0.0; self.layout.dim];
            loop {
                let sides: Vec<u8> = ids.iter().map(|_| u8::from(rng.next_u32() & 1 == 1)).collect();
                let left: Vec<NodeId> = ids.iter().zip(&sides).filter(|(_, &s)| s == 0).map(|(&id, _)| id).collect();
                let right: Vec<NodeId> = ids.iter().zip(&sides).filter(|(_, &s)| s == 1).map(|(&id, _)| id).collect();
                if !left.is_empty() && !right.is_empty() {
                    left_right = (left, right);
                    break;
                }
            }
        }

        // Canonical orientation: the larger partition becomes child 0.
        let (child0_ids, child1_ids) = if left_right.0.len() >= left_right.1.len() {
            (left_right.0, left_right.1)
        } else {
            (left_right.1, left_right.0)
        };

        let n_descendants = i32::try_from(ids.len()).unwrap_or(i32::MAX);
        let mut split = Node::new_split([0, 0], plane.clone(), n_descendants, self.layout.tree_count);
        split.parents[tree_index] = parent;
        let split_id = self.allocate(&split)?;

        let child0 = self.make_tree(tree_index, split_id, &child0_ids, rng)?;
        let child1 = self.make_tree(tree_index, split_id, &child1_ids, rng)?;

        split.body = NodeBody::Split { children: [child0, child1], v: plane };
        self.store.update(split_id, &split)?;

        Ok(split_id)
    }

    /// Removes the item with key `key`.
    pub fn remove(&self, key: i32) -> Result<()> {
        let leaf_id = self.keymap.id_from_key(key)?;

        let chunks = self.chunk_trees();
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .map(|chunk| {
                    scope.spawn(|| {
                        let mut first_err = None;
                        for &t in chunk {
                            if let Err(e) = self.remove_from_tree(t, leaf_id) {
                                log::warn!("remove: tree {t} failed for key {key}: {e}");
                                first_err.get_or_insert(e);
                            }
                        }
                        first_err.map_or(Ok(()), Err)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker panicked")).collect()
        });

        for r in results {
            r?;
        }

        self.destroy(leaf_id)?;
        self.keymap.remove_by_key(key);
        Ok(())
    }

    fn remove_from_tree(&self, tree_index: usize, leaf_id: NodeId) -> Result<()> {
        let leaf = self.store.find(leaf_id)?;
        let parent_id = leaf.parents[tree_index];

        if parent_id == NONE {
            self.meta.update_root(tree_index, NONE)?;
            return Ok(());
        }

        let parent = self.store.find(parent_id)?;

        if let NodeBody::Bucket { children } = &parent.body {
            if children.len() > 2 {
                let new_children: Vec<NodeId> =
                    children.iter().copied().filter(|&c| c != leaf_id).collect();
                let mut updated = parent.clone();
                updated.n_descendants = i32::try_from(new_children.len()).unwrap_or(i32::MAX);
                updated.body = NodeBody::Bucket { children: new_children };
                self.store.update(parent_id, &updated)?;
                return self.propagate_n_descendants(tree_index, parent.parents[tree_index], -1);
            }
        }

        // Parent has exactly two children (a bucket-of-two or a split):
        // collapse it, promoting the surviving sibling.
        let children = parent.body.children();
        if children.len() != 2 {
            return Err(Error::Invariant(format!(
                "parent {parent_id} has {} children, expected 2",
                children.len()
            )));
        }
        let sibling = if children[0] == leaf_id { children[1] } else { children[0] };
        let grandparent = parent.parents[tree_index];

        if grandparent == NONE {
            self.meta.update_root(tree_index, sibling)?;
            self.store.update_parent(sibling, tree_index, NONE)?;
        } else {
            self.replace_child(grandparent, tree_index, parent_id, sibling)?;
        }

        self.destroy(parent_id)?;
        self.propagate_n_descendants(tree_index, grandparent, -1)
    }

    /// `Update(key, v)`: remove then add, tolerating a missing key so the
    /// Apply Engine can treat binlog `UPDATE` rows as upserts.
    pub fn update(&self, key: i32, v: Vec<f64>) -> Result<()> {
        match self.remove(key) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.add(key, v)
    }

    /// Rebuilds every tree from scratch over the current live leaf set.
    ///
    /// This is the Apply Engine's "derived search structure" step (§4.10):
    /// incremental inserts keep the forest query-able at every point, but
    /// repeated bucket promotions can leave it less balanced than a fresh
    /// build over the final item set, so a full rebuild is run once per
    /// apply cycle rather than relying purely on incremental structure.
    pub fn rebuild_all(&self) -> Result<()> {
        let mut leaf_ids: Vec<NodeId> = Vec::new();
        let mut internal_ids: Vec<NodeId> = Vec::new();
        for entry in self.store.iterate()? {
            let (id, node) = entry?;
            if node.free {
                continue;
            }
            if node.body.is_leaf() {
                leaf_ids.push(id);
            } else {
                internal_ids.push(id);
            }
        }

        // Every tree is about to be rebuilt from `leaf_ids` alone, so the old
        // bucket/split nodes become unreachable the moment the new roots are
        // published. Tombstone them and return their slots to the Free List
        // now, or they'd sit as unreachable non-free nodes (invariant 2) and
        // leak space on every apply cycle.
        for id in internal_ids {
            self.destroy(id)?;
        }

        let pool = self.worker_pool_size();
        let mut chunks = vec![Vec::new(); pool];
        for t in 0..self.layout.tree_count {
            chunks[t % pool].push(t);
        }

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .map(|chunk| {
                    scope.spawn(|| {
                        self.with_rng(|rng| {
                            for &t in chunk {
                                if leaf_ids.is_empty() {
                                    self.meta.update_root(t, NONE)?;
                                    continue;
                                }
                                let root = self.make_tree(t, NONE, &leaf_ids, rng)?;
                                self.meta.update_root(t, root)?;
                            }
                            Ok(())
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker panicked")).collect()
        });

        for r in results {
            r?;
        }

        Ok(())
    }
}

fn partition(
    ids: &[NodeId],
    vectors: &[Vec<f64>],
    plane: &[f64],
    metric: &Metric,
    rng: &mut dyn RngCore,
) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (&id, v) in ids.iter().zip(vectors) {
        match metric.side(plane, v, rng) {
            0 => left.push(id),
            _ => right.push(id),
        }
    }
    (left, right)
}
