// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Durable stack of reusable node IDs freed by deletions (C3).

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use byteorder::{BigEndian, ByteOrder};

use crate::{
    error::Result,
    node::{Node, NodeId},
    node_store::NodeStore,
};

const ENTRY_LEN: u64 = 4;

/// LIFO of freed node slots, persisted as 4-byte big-endian integers.
/// `push`/`pop` are serialized through an internal mutex, mirroring the
/// donor engine's single-writer discipline for small append-only files.
pub struct FreeList {
    file: Mutex<File>,
}

impl FreeList {
    /// Opens (creating if absent) the free-list file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Appends a freed node ID.
    pub fn push(&self, id: NodeId) -> Result<()> {
        let mut file = self.file.lock().expect("lock is poisoned");
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, id);
        file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Pops the most recently freed ID, or `None` if the list is empty.
    pub fn pop(&self) -> Result<Option<NodeId>> {
        let mut file = self.file.lock().expect("lock is poisoned");
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 4];
        file.seek(SeekFrom::Start(len - ENTRY_LEN))?;
        file.read_exact(&mut buf)?;
        file.set_len(len - ENTRY_LEN)?;

        Ok(Some(BigEndian::read_i32(&buf)))
    }

    /// Returns the full current contents, bottom of stack first. Used by
    /// property tests (testable property 5) and by recovery.
    pub fn contents(&self) -> Result<Vec<NodeId>> {
        let mut file = self.file.lock().expect("lock is poisoned");
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        Ok(bytes.chunks_exact(4).map(BigEndian::read_i32).collect())
    }
}

/// Creates `node` in `store`, reusing a freed slot if one is available and
/// otherwise falling back to an append. This is the `newNode` path from the
/// Forest Engine: it never exposes raw `pop`/`create` choice to callers.
pub fn allocate(free_list: &FreeList, store: &dyn NodeStore, node: &Node) -> Result<NodeId> {
    match free_list.pop()? {
        Some(id) => {
            store.update(id, node)?;
            Ok(id)
        }
        None => store.create(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Layout;
    use crate::node_store::FileNodeStore;

    #[test]
    fn push_pop_is_lifo() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let list = FreeList::open(&dir.path().join("db.free")).expect("open");

        assert_eq!(list.pop().expect("pop"), None);

        list.push(3).expect("push");
        list.push(7).expect("push");
        list.push(9).expect("push");

        assert_eq!(list.pop().expect("pop"), Some(9));
        assert_eq!(list.pop().expect("pop"), Some(7));
        assert_eq!(list.contents().expect("contents"), vec![3]);
        assert_eq!(list.pop().expect("pop"), Some(3));
        assert_eq!(list.pop().expect("pop"), None);
    }

    #[test]
    fn allocate_reuses_freed_slot_before_appending() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let layout = Layout::new(1, 2, 4);
        let store = FileNodeStore::open(&dir.path().join("db.tree"), layout).expect("open");
        let list = FreeList::open(&dir.path().join("db.free")).expect("open");

        let a = allocate(&list, &store, &Node::new_leaf(1, vec![0.0, 0.0], 1)).expect("alloc a");
        let b = allocate(&list, &store, &Node::new_leaf(2, vec![0.0, 0.0], 1)).expect("alloc b");
        assert_eq!((a, b), (0, 1));

        store.delete(a).expect("delete a");
        list.push(a).expect("push a");

        let c = allocate(&list, &store, &Node::new_leaf(3, vec![0.0, 0.0], 1)).expect("alloc c");
        assert_eq!(c, a, "freed slot should be reused instead of appending");
        assert_eq!(store.len().expect("len"), 2);
    }
}
