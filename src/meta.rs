// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-database header: tree count, dimensionality, bucket capacity, forest
//! root IDs, and the configured distance metric (C5).

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use byteorder::{BigEndian, ByteOrder};

use crate::{
    distance::MetricKind,
    error::{Error, Result},
    lock::{self, Range},
    node::NONE,
};

/// Fixed-layout header file, one per database.
///
/// ```text
/// +4 tree_count T (i32)
/// +4 dim D (i32)
/// +4 bucket_capacity K (i32)
/// +1 metric tag
/// +4·T root_ids (i32 each, -1 when tree is empty)
/// ```
///
/// The metric tag is this rewrite's addition (§4.6 expansion): the original
/// encoded the chosen metric in the database's file-naming convention, which
/// this layout instead makes an explicit persisted field so `apply`/reopen
/// always reconstructs the same metric.
pub struct Meta {
    file: File,
    tree_count: usize,
    dim: usize,
    bucket_capacity: usize,
    metric: MetricKind,
}

const HEADER_LEN: u64 = 4 + 4 + 4 + 1;

impl Meta {
    fn roots_offset(&self) -> u64 {
        HEADER_LEN
    }

    /// Creates a brand-new meta file; fails if one already exists at `path`.
    pub fn create(
        path: &Path,
        tree_count: usize,
        dim: usize,
        bucket_capacity: usize,
        metric: MetricKind,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let meta = Self { file, tree_count, dim, bucket_capacity, metric };

        let mut header = vec![0u8; HEADER_LEN as usize + 4 * tree_count];
        BigEndian::write_i32(&mut header[0..4], tree_count as i32);
        BigEndian::write_i32(&mut header[4..8], dim as i32);
        BigEndian::write_i32(&mut header[8..12], bucket_capacity as i32);
        header[12] = metric as u8;
        for t in 0..tree_count {
            let off = HEADER_LEN as usize + 4 * t;
            BigEndian::write_i32(&mut header[off..off + 4], NONE);
        }
        meta.file.write_all_at(&header, 0)?;

        Ok(meta)
    }

    /// Opens an existing meta file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;

        let tree_count = BigEndian::read_i32(&header[0..4]) as usize;
        let dim = BigEndian::read_i32(&header[4..8]) as usize;
        let bucket_capacity = BigEndian::read_i32(&header[8..12]) as usize;
        let metric = MetricKind::try_from(header[12])?;

        Ok(Self { file, tree_count, dim, bucket_capacity, metric })
    }

    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.tree_count
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    #[must_use]
    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Reads all root slots under a shared lock.
    pub fn roots(&self) -> Result<Vec<i32>> {
        let len = 4 * self.tree_count as u64;
        let _guard = lock::read_lock(&self.file, Range::new(self.roots_offset(), len))?;

        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, self.roots_offset())?;

        Ok(buf.chunks_exact(4).map(BigEndian::read_i32).collect())
    }

    /// Writes exactly 4 bytes for one tree's root under a 4-byte write lock,
    /// so independent trees can update their roots concurrently.
    pub fn update_root(&self, tree_index: usize, new_root_id: i32) -> Result<()> {
        if tree_index >= self.tree_count {
            return Err(Error::Invariant(format!(
                "tree index {tree_index} out of range (tree_count={})",
                self.tree_count
            )));
        }

        let offset = self.roots_offset() + 4 * tree_index as u64;
        let _guard = lock::write_lock(&self.file, Range::new(offset, 4))?;

        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, new_root_id);
        self.file.write_all_at(&buf, offset)?;

        Ok(())
    }
}
