// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Canonical per-database filenames (§6 EXTERNAL INTERFACES).

use std::path::{Path, PathBuf};

/// The five files that make up one database, all living in the same
/// directory and named after it.
#[derive(Debug, Clone)]
pub struct DbPaths {
    pub meta: PathBuf,
    pub tree: PathBuf,
    pub map: PathBuf,
    pub free: PathBuf,
    pub bin: PathBuf,
}

impl DbPaths {
    #[must_use]
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            meta: dir.join(format!("{name}.meta")),
            tree: dir.join(format!("{name}.tree")),
            map: dir.join(format!("{name}.map")),
            free: dir.join(format!("{name}.free")),
            bin: dir.join(format!("{name}.bin")),
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.meta.exists()
    }
}
