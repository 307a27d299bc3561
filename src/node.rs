// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The universal on-disk record (§3 DATA MODEL) and its big-endian wire format.

use byteorder::{ByteOrder, BigEndian};

use crate::error::{Error, Result};

/// Node identifier: a slot index into the Node Store. `-1` is the sentinel
/// meaning "no node" (used for `parents[t]` on a tree root).
pub type NodeId = i32;

/// Sentinel used in `parents[t]` for a tree root and in Meta for an empty tree.
pub const NONE: NodeId = -1;

/// The role-specific payload of a node. The role itself is never stored as a
/// tag byte on disk -- it is recovered from `n_descendants` and the bucket
/// capacity `K` at decode time, exactly as `make_tree` never produces a split
/// node with `n_descendants <= K`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBody {
    /// A single indexed item.
    Leaf { v: Vec<f64> },
    /// Up to `K` leaf children, no hyperplane.
    Bucket { children: Vec<NodeId> },
    /// A hyperplane and exactly two children.
    Split { children: [NodeId; 2], v: Vec<f64> },
}

impl NodeBody {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    #[must_use]
    pub fn is_bucket(&self) -> bool {
        matches!(self, Self::Bucket { .. })
    }

    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(self, Self::Split { .. })
    }

    /// Returns this node's children as a slice, empty for a leaf.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        match self {
            Self::Leaf { .. } => &[],
            Self::Bucket { children } => children,
            Self::Split { children, .. } => children,
        }
    }
}

/// A fully decoded node record.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub free: bool,
    pub n_descendants: i32,
    /// Caller-visible key; meaningful only for a leaf.
    pub key: i32,
    /// One parent slot per tree; `NONE` means "this node is tree `t`'s root".
    pub parents: Vec<NodeId>,
    pub body: NodeBody,
}

impl Node {
    #[must_use]
    pub fn new_leaf(key: i32, v: Vec<f64>, tree_count: usize) -> Self {
        Self {
            free: false,
            n_descendants: 1,
            key,
            parents: vec![NONE; tree_count],
            body: NodeBody::Leaf { v },
        }
    }

    #[must_use]
    pub fn new_bucket(children: Vec<NodeId>, tree_count: usize) -> Self {
        let n_descendants = i32::try_from(children.len()).unwrap_or(i32::MAX);
        Self {
            free: false,
            n_descendants,
            key: 0,
            parents: vec![NONE; tree_count],
            body: NodeBody::Bucket { children },
        }
    }

    #[must_use]
    pub fn new_split(children: [NodeId; 2], v: Vec<f64>, n_descendants: i32, tree_count: usize) -> Self {
        Self {
            free: false,
            n_descendants,
            key: 0,
            parents: vec![NONE; tree_count],
            body: NodeBody::Split { children, v },
        }
    }

    /// Marks this node free, leaving the rest of the record zeroed out for
    /// determinism (byte-exact save/load, per testable property 9).
    #[must_use]
    pub fn tombstoned(tree_count: usize) -> Self {
        Self {
            free: true,
            n_descendants: 0,
            key: 0,
            parents: vec![NONE; tree_count],
            body: NodeBody::Bucket { children: vec![] },
        }
    }

    #[must_use]
    pub fn role_name(&self) -> &'static str {
        match self.body {
            NodeBody::Leaf { .. } => "leaf",
            NodeBody::Bucket { .. } => "bucket",
            NodeBody::Split { .. } => "split",
        }
    }
}

/// Fixed geometry of a database's record layout, derived from Meta.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub tree_count: usize,
    pub dim: usize,
    pub bucket_capacity: usize,
}

impl Layout {
    #[must_use]
    pub fn new(tree_count: usize, dim: usize, bucket_capacity: usize) -> Self {
        Self { tree_count, dim, bucket_capacity }
    }

    /// Byte length of the trailing `children`/`v` region shared by all roles:
    /// big enough for either `K` bucket-child IDs or 2 split children plus a
    /// `D`-dimensional `f64` hyperplane/vector.
    #[must_use]
    pub fn tail_len(&self) -> usize {
        (4 * self.bucket_capacity).max(4 * 2 + 8 * self.dim)
    }

    /// Total on-disk record length in bytes.
    #[must_use]
    pub fn record_len(&self) -> usize {
        1 + 4 + 4 + 4 * self.tree_count + self.tail_len()
    }
}

impl Node {
    /// Encodes this node into exactly `layout.record_len()` bytes.
    pub fn encode(&self, layout: Layout) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; layout.record_len()];

        buf[0] = u8::from(self.free);
        BigEndian::write_i32(&mut buf[1..5], self.n_descendants);
        BigEndian::write_i32(&mut buf[5..9], self.key);

        if self.parents.len() != layout.tree_count {
            return Err(Error::Invariant(format!(
                "node has {} parent slots, expected {}",
                self.parents.len(),
                layout.tree_count
            )));
        }

        let parents_start = 9;
        for (t, parent) in self.parents.iter().enumerate() {
            let off = parents_start + 4 * t;
            BigEndian::write_i32(&mut buf[off..off + 4], *parent);
        }

        let tail_start = parents_start + 4 * layout.tree_count;
        let tail = &mut buf[tail_start..];

        match &self.body {
            NodeBody::Leaf { v } => {
                encode_children_and_v(tail, &[], v, layout)?;
            }
            NodeBody::Split { children, v } => {
                encode_children_and_v(tail, children, v, layout)?;
            }
            NodeBody::Bucket { children } => {
                if children.len() > layout.bucket_capacity {
                    return Err(Error::Invariant(format!(
                        "bucket has {} children, capacity is {}",
                        children.len(),
                        layout.bucket_capacity
                    )));
                }
                for (i, child) in children.iter().enumerate() {
                    let off = 4 * i;
                    BigEndian::write_i32(&mut tail[off..off + 4], *child);
                }
            }
        }

        Ok(buf)
    }

    /// Decodes a node from exactly `layout.record_len()` bytes.
    ///
    /// The role is recovered from `n_descendants` versus `K`, not an on-disk
    /// tag: `n_descendants == 1` is a leaf, `n_descendants <= K` is a bucket
    /// (by construction `make_tree` never builds a split with that few
    /// descendants), otherwise it is a split.
    pub fn decode(buf: &[u8], layout: Layout) -> Result<Self> {
        if buf.len() != layout.record_len() {
            return Err(Error::Invariant(format!(
                "record is {} bytes, expected {}",
                buf.len(),
                layout.record_len()
            )));
        }

        let free = buf[0] != 0;
        let n_descendants = BigEndian::read_i32(&buf[1..5]);
        let key = BigEndian::read_i32(&buf[5..9]);

        let parents_start = 9;
        let mut parents = Vec::with_capacity(layout.tree_count);
        for t in 0..layout.tree_count {
            let off = parents_start + 4 * t;
            parents.push(BigEndian::read_i32(&buf[off..off + 4]));
        }

        let tail_start = parents_start + 4 * layout.tree_count;
        let tail = &buf[tail_start..];

        let body = if free {
            NodeBody::Bucket { children: vec![] }
        } else if n_descendants == 1 {
            let v = read_v(tail_after_children(tail, 2), layout.dim);
            NodeBody::Leaf { v }
        } else if usize::try_from(n_descendants.max(0)).unwrap_or(usize::MAX) <= layout.bucket_capacity {
            let count = usize::try_from(n_descendants.max(0)).unwrap_or(0);
            let mut children = Vec::with_capacity(count);
            for i in 0..count {
                let off = 4 * i;
                children.push(BigEndian::read_i32(&tail[off..off + 4]));
            }
            NodeBody::Bucket { children }
        } else {
            let c0 = BigEndian::read_i32(&tail[0..4]);
            let c1 = BigEndian::read_i32(&tail[4..8]);
            let v = read_v(tail_after_children(tail, 2), layout.dim);
            NodeBody::Split { children: [c0, c1], v }
        };

        Ok(Self { free, n_descendants, key, parents, body })
    }
}

fn tail_after_children(tail: &[u8], n_children: usize) -> &[u8] {
    &tail[4 * n_children..]
}

fn read_v(buf: &[u8], dim: usize) -> Vec<f64> {
    let mut v = Vec::with_capacity(dim);
    for i in 0..dim {
        let off = 8 * i;
        v.push(BigEndian::read_f64(&buf[off..off + 8]));
    }
    v
}

fn encode_children_and_v(tail: &mut [u8], children: &[NodeId], v: &[f64], layout: Layout) -> Result<()> {
    if children.len() > 2 {
        return Err(Error::Invariant("split/leaf record has more than 2 children".into()));
    }
    if v.len() != layout.dim && !v.is_empty() {
        return Err(Error::Invariant(format!(
            "vector has {} dims, expected {}",
            v.len(),
            layout.dim
        )));
    }

    for (i, child) in children.iter().enumerate() {
        let off = 4 * i;
        BigEndian::write_i32(&mut tail[off..off + 4], *child);
    }

    let v_start = 4 * 2;
    for (i, x) in v.iter().enumerate() {
        let off = v_start + 8 * i;
        BigEndian::write_f64(&mut tail[off..off + 8], *x);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_leaf() {
        let layout = Layout::new(2, 3, 4);
        let node = Node::new_leaf(42, vec![0.1, 0.2, 0.3], 2);
        let bytes = node.encode(layout).expect("encode");
        assert_eq!(bytes.len(), layout.record_len());
        let decoded = Node::decode(&bytes, layout).expect("decode");
        assert_eq!(decoded, node);
        assert!(decoded.body.is_leaf());
    }

    #[test]
    fn round_trips_bucket() {
        let layout = Layout::new(1, 3, 4);
        let node = Node::new_bucket(vec![1, 2, 3], 1);
        let bytes = node.encode(layout).expect("encode");
        let decoded = Node::decode(&bytes, layout).expect("decode");
        assert_eq!(decoded, node);
        assert!(decoded.body.is_bucket());
    }

    #[test]
    fn round_trips_split() {
        let layout = Layout::new(1, 3, 4);
        let mut node = Node::new_split([10, 11], vec![1.0, -1.0, 0.5], 7, 1);
        node.key = 0;
        let bytes = node.encode(layout).expect("encode");
        let decoded = Node::decode(&bytes, layout).expect("decode");
        assert_eq!(decoded, node);
        assert!(decoded.body.is_split());
    }

    #[test]
    fn record_len_matches_spec_formula() {
        let layout = Layout::new(3, 8, 5);
        // 1 + 4 + 4 + 4*3 + max(4*5, 4*2+8*8)
        assert_eq!(layout.record_len(), 1 + 4 + 4 + 12 + (20usize.max(8 + 64)));
    }
}
