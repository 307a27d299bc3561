// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The fixed-size record file holding every node (C2).
//!
//! Per the redesign notes, storage is exposed behind one trait so a
//! file-backed implementation and an in-memory one (tests only) share the
//! same call sites; a database handle is wired to exactly one of them.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::{Mutex, RwLock},
};

use byteorder::ByteOrder;

use crate::{
    error::{Error, Result},
    lock::{self, Range},
    node::{Layout, Node, NodeId},
};

/// Shared storage contract for nodes: append-on-create, in-place update,
/// tombstone-on-delete, slot-order iteration.
pub trait NodeStore: Send + Sync {
    /// Appends a new record and returns its slot ID. The only operation that
    /// may grow the store.
    fn create(&self, node: &Node) -> Result<NodeId>;

    /// Reads one record under a shared range lock.
    fn find(&self, id: NodeId) -> Result<Node>;

    /// Overwrites one record in place under an exclusive range lock.
    fn update(&self, id: NodeId, node: &Node) -> Result<()>;

    /// Rewrites only the 4-byte `parents[tree_index]` slot.
    fn update_parent(&self, id: NodeId, tree_index: usize, new_parent: NodeId) -> Result<()>;

    /// Tombstones a record (`free = true`); does not return its slot to the
    /// Free List -- callers do that explicitly via [`crate::free_list::FreeList`].
    fn delete(&self, id: NodeId) -> Result<()>;

    /// Number of slots currently in the store (including tombstoned ones).
    fn len(&self) -> Result<usize>;

    /// Iterates every slot in order. Used at startup to rebuild the Free
    /// List and Key↔ID Map; not restartable.
    fn iterate(&self) -> Result<Box<dyn Iterator<Item = Result<(NodeId, Node)>> + '_>>;

    /// Record geometry for this store.
    fn layout(&self) -> Layout;
}

/// File-backed [`NodeStore`]; the default implementation for live databases.
pub struct FileNodeStore {
    file: File,
    layout: Layout,
    append_lock: Mutex<()>,
}

impl FileNodeStore {
    /// Opens (creating if absent) the node record file at `path`.
    pub fn open(path: &Path, layout: Layout) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Ok(Self { file, layout, append_lock: Mutex::new(()) })
    }

    fn offset_of(&self, id: NodeId) -> Result<u64> {
        if id < 0 {
            return Err(Error::Invariant(format!("negative node id {id}")));
        }
        Ok(u64::from(u32::try_from(id).map_err(|_| Error::Invariant("node id overflow".into()))?)
            * self.layout.record_len() as u64)
    }
}

impl NodeStore for FileNodeStore {
    fn create(&self, node: &Node) -> Result<NodeId> {
        let _append_guard = self.append_lock.lock().expect("lock is poisoned");

        let record_len = self.layout.record_len() as u64;
        let current_len = self.file.metadata()?.len();
        if current_len % record_len != 0 {
            return Err(Error::Invariant("node store length is not record-aligned".into()));
        }

        let id = (current_len / record_len) as NodeId;
        let bytes = node.encode(self.layout)?;
        self.file.write_all_at(&bytes, current_len)?;

        Ok(id)
    }

    fn find(&self, id: NodeId) -> Result<Node> {
        let offset = self.offset_of(id)?;
        let record_len = self.layout.record_len();

        let _guard = lock::read_lock(&self.file, Range::new(offset, record_len as u64))?;

        let mut buf = vec![0u8; record_len];
        self.file.read_exact_at(&mut buf, offset)?;

        Node::decode(&buf, self.layout)
    }

    fn update(&self, id: NodeId, node: &Node) -> Result<()> {
        let offset = self.offset_of(id)?;
        let record_len = self.layout.record_len();

        let _guard = lock::write_lock(&self.file, Range::new(offset, record_len as u64))?;

        let bytes = node.encode(self.layout)?;
        self.file.write_all_at(&bytes, offset)?;

        Ok(())
    }

    fn update_parent(&self, id: NodeId, tree_index: usize, new_parent: NodeId) -> Result<()> {
        if tree_index >= self.layout.tree_count {
            return Err(Error::Invariant(format!(
                "tree index {tree_index} out of range (tree_count={})",
                self.layout.tree_count
            )));
        }

        let base = self.offset_of(id)?;
        let parent_offset = base + 9 + 4 * tree_index as u64;

        let _guard = lock::write_lock(&self.file, Range::new(parent_offset, 4))?;

        let mut buf = [0u8; 4];
        byteorder::BigEndian::write_i32(&mut buf, new_parent);
        self.file.write_all_at(&buf, parent_offset)?;

        Ok(())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.update(id, &Node::tombstoned(self.layout.tree_count))
    }

    fn len(&self) -> Result<usize> {
        let record_len = self.layout.record_len() as u64;
        Ok((self.file.metadata()?.len() / record_len) as usize)
    }

    fn iterate(&self) -> Result<Box<dyn Iterator<Item = Result<(NodeId, Node)>> + '_>> {
        let count = self.len()?;
        Ok(Box::new((0..count as NodeId).map(move |id| self.find(id).map(|n| (id, n)))))
    }

    fn layout(&self) -> Layout {
        self.layout
    }
}

/// In-memory [`NodeStore`] used only by tests (per the redesign notes: never
/// exposed to the same database instance alongside the file-backed store).
pub struct MemoryNodeStore {
    slots: RwLock<Vec<Node>>,
    layout: Layout,
}

impl MemoryNodeStore {
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        Self { slots: RwLock::new(Vec::new()), layout }
    }
}

impl NodeStore for MemoryNodeStore {
    fn create(&self, node: &Node) -> Result<NodeId> {
        let mut slots = self.slots.write().expect("lock is poisoned");
        let id = slots.len() as NodeId;
        slots.push(node.clone());
        Ok(id)
    }

    fn find(&self, id: NodeId) -> Result<Node> {
        let slots = self.slots.read().expect("lock is poisoned");
        slots
            .get(usize::try_from(id).map_err(|_| Error::Invariant("negative node id".into()))?)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn update(&self, id: NodeId, node: &Node) -> Result<()> {
        let mut slots = self.slots.write().expect("lock is poisoned");
        let slot = slots
            .get_mut(usize::try_from(id).map_err(|_| Error::Invariant("negative node id".into()))?)
            .ok_or(Error::NotFound)?;
        *slot = node.clone();
        Ok(())
    }

    fn update_parent(&self, id: NodeId, tree_index: usize, new_parent: NodeId) -> Result<()> {
        let mut slots = self.slots.write().expect("lock is poisoned");
        let slot = slots
            .get_mut(usize::try_from(id).map_err(|_| Error::Invariant("negative node id".into()))?)
            .ok_or(Error::NotFound)?;
        let parent = slot
            .parents
            .get_mut(tree_index)
            .ok_or_else(|| Error::Invariant("tree index out of range".into()))?;
        *parent = new_parent;
        Ok(())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.update(id, &Node::tombstoned(self.layout.tree_count))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.slots.read().expect("lock is poisoned").len())
    }

    fn iterate(&self) -> Result<Box<dyn Iterator<Item = Result<(NodeId, Node)>> + '_>> {
        let count = self.len()?;
        Ok(Box::new((0..count as NodeId).map(move |id| self.find(id).map(|n| (id, n)))))
    }

    fn layout(&self) -> Layout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(1, 3, 4)
    }

    #[test]
    fn file_store_create_find_update_delete() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = FileNodeStore::open(&dir.path().join("db.tree"), layout()).expect("open");

        let leaf = Node::new_leaf(7, vec![1.0, 2.0, 3.0], 1);
        let id = store.create(&leaf).expect("create");
        assert_eq!(store.find(id).expect("find"), leaf);

        let mut updated = leaf.clone();
        updated.key = 9;
        store.update(id, &updated).expect("update");
        assert_eq!(store.find(id).expect("find"), updated);

        store.update_parent(id, 0, 5).expect("update_parent");
        assert_eq!(store.find(id).expect("find").parents, vec![5]);

        store.delete(id).expect("delete");
        assert!(store.find(id).expect("find").free);
    }

    #[test]
    fn file_store_iterate_is_slot_ordered() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = FileNodeStore::open(&dir.path().join("db.tree"), layout()).expect("open");

        for k in 0..5 {
            store
                .create(&Node::new_leaf(k, vec![k as f64; 3], 1))
                .expect("create");
        }

        let ids: Vec<i32> = store
            .iterate()
            .expect("iterate")
            .map(|r| r.expect("node").0)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn memory_store_matches_file_store_semantics() {
        let store = MemoryNodeStore::new(layout());
        let leaf = Node::new_leaf(1, vec![0.0, 0.0, 0.0], 1);
        let id = store.create(&leaf).expect("create");
        assert_eq!(store.find(id).expect("find"), leaf);
        store.delete(id).expect("delete");
        assert!(store.find(id).expect("find").free);
    }
}
