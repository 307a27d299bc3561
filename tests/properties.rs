// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Property tests over randomized mutation sequences (spec §8, invariants
//! 1-6 and boundary behaviors 10-13), run against an in-memory store so a
//! single `quickcheck` shrink pass stays fast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use quickcheck::{Arbitrary, Gen, TestResult};
use quickcheck_macros::quickcheck;

use annforest::distance::{Metric, MetricKind};
use annforest::forest::Forest;
use annforest::free_list::FreeList;
use annforest::keymap::KeyMap;
use annforest::meta::Meta;
use annforest::node::{Layout, NodeBody, NONE};
use annforest::node_store::{MemoryNodeStore, NodeStore};

const DIM: usize = 3;
const TREE_COUNT: usize = 3;
const BUCKET_CAPACITY: usize = 4;

#[derive(Clone, Debug)]
enum Op {
    Add(u8),
    Remove(u8),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        let key = u8::arbitrary(g) % 24;
        if bool::arbitrary(g) {
            Op::Add(key)
        } else {
            Op::Remove(key)
        }
    }
}

fn vector_for(key: u8) -> Vec<f64> {
    (0..DIM).map(|i| (key as f64) * 0.1 + i as f64 * 0.01).collect()
}

struct Fixture {
    store: Arc<dyn NodeStore>,
    meta: Arc<Meta>,
    keymap: Arc<KeyMap>,
    free_list: Arc<FreeList>,
    forest: Forest,
    _dir: tempfile::TempDir,
}

fn build_fixture(seed: u64) -> Fixture {
    let dir = tempfile::tempdir().expect("tmpdir");
    let layout = Layout::new(TREE_COUNT, DIM, BUCKET_CAPACITY);
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new(layout));
    let free_list = Arc::new(FreeList::open(&dir.path().join("db.free")).expect("free_list"));
    let meta = Arc::new(
        Meta::create(&dir.path().join("db.meta"), TREE_COUNT, DIM, BUCKET_CAPACITY, MetricKind::Euclidean)
            .expect("meta"),
    );
    let keymap = Arc::new(KeyMap::new());
    let metric = Metric::from(MetricKind::Euclidean);
    let forest = Forest::with_seed(layout, metric, store.clone(), free_list.clone(), meta.clone(), keymap.clone(), seed);

    Fixture { store, meta, keymap, free_list, forest, _dir: dir }
}

/// Checks invariants 3-6 against the current state of a fixture. Invariant
/// 1/2 (reachability and parent back-references) are exercised indirectly:
/// every `search_item` call in the scenario tests descends exactly the path
/// these invariants require, and a structural violation there surfaces as
/// `Error::Invariant` rather than a silent wrong answer.
fn check_invariants(fixture: &Fixture) -> Result<(), String> {
    let mut live_keys: HashSet<i32> = HashSet::new();
    let mut live_ids: HashSet<i32> = HashSet::new();
    let mut free_ids: HashSet<i32> = HashSet::new();
    let mut nodes: HashMap<i32, annforest::node::Node> = HashMap::new();

    for entry in fixture.store.iterate().map_err(|e| e.to_string())? {
        let (id, node) = entry.map_err(|e| e.to_string())?;
        if node.free {
            free_ids.insert(id);
        } else if node.body.is_leaf() {
            live_keys.insert(node.key);
            live_ids.insert(id);
        }
        nodes.insert(id, node);
    }

    // Invariant 4: Key<->ID Map is a bijection over live leaves.
    let map_keys: HashSet<i32> = fixture.keymap.entries().iter().map(|(k, _)| *k).collect();
    if map_keys != live_keys {
        return Err(format!("keymap keys {map_keys:?} != live leaf keys {live_keys:?}"));
    }
    for (key, id) in fixture.keymap.entries() {
        match nodes.get(&id) {
            Some(n) if !n.free && n.key == key => {}
            other => return Err(format!("keymap entry ({key}, {id}) does not match node {other:?}")),
        }
    }

    // Invariant 5: Free List contents equal the set of free==true slots.
    let free_list_contents: HashSet<i32> = fixture.free_list.contents().map_err(|e| e.to_string())?.into_iter().collect();
    if free_list_contents != free_ids {
        return Err(format!("free list {free_list_contents:?} != free slots {free_ids:?}"));
    }

    // Invariants 3 and 6: bucket size bounds and n_descendants consistency.
    for (id, node) in &nodes {
        if node.free {
            continue;
        }
        match &node.body {
            NodeBody::Bucket { children } => {
                if children.len() < 2 || children.len() > BUCKET_CAPACITY {
                    return Err(format!("bucket {id} has {} children", children.len()));
                }
                if node.n_descendants as usize != children.len() {
                    return Err(format!("bucket {id} n_descendants mismatch"));
                }
            }
            NodeBody::Split { children, .. } => {
                let sum: i32 = children
                    .iter()
                    .map(|c| nodes.get(c).map(|n| n.n_descendants).unwrap_or(0))
                    .sum();
                if node.n_descendants != sum {
                    return Err(format!("split {id} n_descendants {} != child sum {sum}", node.n_descendants));
                }
            }
            NodeBody::Leaf { .. } => {}
        }
    }

    // Invariant 2 (sampled): every non-root node appears in its parent's children.
    for (id, node) in &nodes {
        if node.free {
            continue;
        }
        for (t, &parent) in node.parents.iter().enumerate() {
            if parent == NONE {
                continue;
            }
            let Some(parent_node) = nodes.get(&parent) else {
                return Err(format!("node {id}'s tree-{t} parent {parent} does not exist"));
            };
            if parent_node.free || !parent_node.body.children().contains(id) {
                return Err(format!("node {id} missing from tree-{t} parent {parent}'s children"));
            }
        }
    }

    let roots = fixture.meta.roots().map_err(|e| e.to_string())?;
    if roots.len() != TREE_COUNT {
        return Err("unexpected root count".into());
    }

    Ok(())
}

#[quickcheck]
fn invariants_hold_after_any_add_remove_sequence(ops: Vec<Op>) -> TestResult {
    if ops.len() > 60 {
        return TestResult::discard();
    }

    let fixture = build_fixture(42);
    let mut expected_live: HashSet<u8> = HashSet::new();

    for op in ops {
        match op {
            Op::Add(key) => {
                let v = vector_for(key);
                if fixture.forest.add(key as i32, v).is_ok() {
                    expected_live.insert(key);
                }
            }
            Op::Remove(key) => {
                if fixture.forest.remove(key as i32).is_ok() {
                    expected_live.remove(&key);
                }
            }
        }
    }

    if let Err(msg) = check_invariants(&fixture) {
        return TestResult::error(msg);
    }

    if fixture.keymap.len() != expected_live.len() {
        return TestResult::error(format!(
            "keymap has {} live entries, expected {}",
            fixture.keymap.len(),
            expected_live.len()
        ));
    }

    TestResult::passed()
}

#[test]
fn add_into_empty_tree_sets_root_then_second_add_reparents() {
    let fixture = build_fixture(7);
    fixture.forest.add(1, vector_for(1)).expect("add 1");

    let roots_after_one = fixture.meta.roots().expect("roots");
    assert!(roots_after_one.iter().all(|&r| r != NONE));
    let first_root = roots_after_one[0];
    let root_node = fixture.store.find(first_root).expect("find root");
    assert!(root_node.body.is_leaf(), "single item forms a leaf-only root");

    fixture.forest.add(2, vector_for(2)).expect("add 2");
    let roots_after_two = fixture.meta.roots().expect("roots");
    let new_root = fixture.store.find(roots_after_two[0]).expect("find new root");
    assert!(!new_root.body.is_leaf(), "second add must reparent the first leaf under a new root");

    check_invariants(&fixture).expect("invariants hold");
}

#[test]
fn add_into_full_bucket_promotes_to_split_and_tombstones_old_bucket() {
    let fixture = build_fixture(13);
    for key in 0..BUCKET_CAPACITY as u8 {
        fixture.forest.add(key as i32, vector_for(key)).expect("add");
    }

    let roots = fixture.meta.roots().expect("roots");
    let bucket_id = roots[0];
    let bucket = fixture.store.find(bucket_id).expect("find bucket");
    assert!(matches!(bucket.body, NodeBody::Bucket { ref children } if children.len() == BUCKET_CAPACITY));

    fixture.forest.add(BUCKET_CAPACITY as i32, vector_for(BUCKET_CAPACITY as u8)).expect("overflow add");

    let old_bucket = fixture.store.find(bucket_id).expect("find old bucket");
    assert!(old_bucket.free, "bucket at capacity must be tombstoned on promotion");

    check_invariants(&fixture).expect("invariants hold");
}

#[test]
fn remove_with_two_sibling_parent_collapses_parent() {
    let fixture = build_fixture(21);
    for key in 0..(BUCKET_CAPACITY as u8 + 1) {
        fixture.forest.add(key as i32, vector_for(key)).expect("add");
    }

    check_invariants(&fixture).expect("invariants hold before remove");
    fixture.forest.remove(0).expect("remove");
    check_invariants(&fixture).expect("invariants hold after remove");
    assert!(fixture.keymap.id_from_key(0).is_err());
}
