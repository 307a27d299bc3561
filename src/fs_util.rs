// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Small filesystem helpers shared by every on-disk component.

use std::{fs, io::Write, path::Path};

/// Atomically rewrites a file's contents.
///
/// Writes to a temp file in the same directory, `fsync`s it, then renames it
/// over the destination. Used by the Key↔ID Map and by the Apply Engine's
/// final rename-into-place step so readers never observe a half-written file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    fsync_directory(folder)?;

    Ok(())
}

/// Renames `from` to `to`, then `fsync`s the containing directory so the
/// rename itself is durable.
pub fn rename_atomic(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::rename(from, to)?;

    if let Some(folder) = to.parent() {
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = fs::File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Directories cannot be fsync'd on Windows.
    Ok(())
}
