// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `annforest` is a persistent, concurrent approximate nearest neighbor
//! index built from a forest of random-projection trees, in the spirit of
//! Annoy: vectors are partitioned by repeatedly splitting them across random
//! hyperplanes (or, for [`distance::MetricKind::Hamming`], random
//! coordinate subsets) until each partition fits a bucket, and a query
//! descends every tree in the forest, collecting candidates with a
//! best-first traversal before scoring and ranking them by true distance.
//!
//! A database is a directory of five files -- a node store, a free list, a
//! key↔id map, a header ("meta"), and a binlog -- addressed together by
//! [`Database`]. Mutations can go through two paths: [`Database::put`]/
//! [`Database::delete`] only append to the binlog and become visible to
//! search once an apply cycle ([`apply::apply_once`] or the background
//! [`apply::ApplyEngine`]) rebuilds the forest and swaps it into place;
//! [`Database::put_online`]/[`Database::delete_online`] mutate the live
//! forest immediately for callers that need lower latency. Many databases
//! under one directory are tracked by a [`registry::DatabaseRegistry`].
//!
//! ```
//! use annforest::database::{CreateOptions, Database};
//! use annforest::distance::MetricKind;
//!
//! # fn main() -> annforest::error::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 4, bucket_capacity: 10 };
//! let db = Database::create(dir.path(), "demo", options)?;
//!
//! db.put_online(1, vec![0.1, 0.2, 0.3])?;
//! db.put_online(2, vec![0.9, 0.8, 0.7])?;
//!
//! let neighbors = db.search_item(1, 1, None)?;
//! assert_eq!(neighbors, vec![1]);
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod binlog;
pub mod config;
pub mod database;
pub mod distance;
pub mod error;
pub mod forest;
pub mod free_list;
pub mod fs_util;
pub mod keymap;
pub mod lock;
pub mod meta;
pub mod node;
pub mod node_store;
pub mod paths;
pub mod registry;
pub mod search;
pub mod serializer;
pub mod stop_signal;

pub use config::Config;
pub use database::{CreateOptions, Database};
pub use distance::{Metric, MetricKind};
pub use error::{Error, Result};
pub use registry::DatabaseRegistry;
