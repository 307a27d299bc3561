// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Advisory byte-range locking over a file descriptor (C1).
//!
//! Two backends are available, selected once at database-open time by a
//! capability check (never per-call): Open File Description (OFD) locks on
//! Linux kernels that advertise them, and a whole-file `flock`-style fallback
//! everywhere else. OFD locks are scoped to the open file description rather
//! than the process, so two threads sharing one descriptor still serialize
//! correctly against each other -- this is the property the Node Store and
//! Meta File rely on for sub-record locking.

use std::{
    fs::File,
    os::unix::io::AsRawFd,
    sync::OnceLock,
};

use crate::error::{Error, Result};

/// What portion of the file a lock covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub len: u64,
}

impl Range {
    #[must_use]
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    #[must_use]
    pub fn whole_file() -> Self {
        Self { offset: 0, len: 0 }
    }
}

/// Lock backend, chosen once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `fcntl(F_OFD_SETLK[W])` -- true byte-range, open-file-description scoped.
    Ofd,
    /// `flock()` via `fs2` -- whole file only, offset/len are ignored.
    WholeFile,
}

static BACKEND: OnceLock<Backend> = OnceLock::new();

/// Detects the best available lock backend for this host.
///
/// OFD locks were added in Linux 3.15; we probe for them directly (rather
/// than parsing `uname`) by attempting a zero-length, zero-offset OFD lock on
/// a throwaway temp file and seeing whether the kernel rejects the command.
#[must_use]
pub fn detect_backend() -> Backend {
    *BACKEND.get_or_init(|| {
        if cfg!(target_os = "linux") && ofd_locks_supported() {
            Backend::Ofd
        } else {
            Backend::WholeFile
        }
    })
}

#[cfg(target_os = "linux")]
fn ofd_locks_supported() -> bool {
    let Ok(file) = tempfile::tempfile() else {
        return false;
    };

    let mut flock = libc::flock {
        l_type: libc::F_RDLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    // SAFETY: `flock` is a plain-old-data struct fully initialized above and
    // the fd is valid for the duration of this call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLK, &mut flock) };
    rc == 0
}

#[cfg(not(target_os = "linux"))]
fn ofd_locks_supported() -> bool {
    false
}

/// A held lock; dropping it releases the range.
pub struct LockGuard<'a> {
    file: &'a File,
    range: Range,
    backend: Backend,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unlock(self.file, self.range, self.backend) {
            log::warn!("failed to release lock on range {:?}: {e}", self.range);
        }
    }
}

/// Acquires a shared (read) lock over `range`, blocking until available.
pub fn read_lock(file: &File, range: Range) -> Result<LockGuard<'_>> {
    let backend = detect_backend();
    lock(file, range, backend, false)?;
    Ok(LockGuard { file, range, backend })
}

/// Acquires an exclusive (write) lock over `range`, blocking until available.
pub fn write_lock(file: &File, range: Range) -> Result<LockGuard<'_>> {
    let backend = detect_backend();
    lock(file, range, backend, true)?;
    Ok(LockGuard { file, range, backend })
}

fn lock(file: &File, range: Range, backend: Backend, exclusive: bool) -> Result<()> {
    match backend {
        Backend::Ofd => ofd_lock(file, range, exclusive),
        Backend::WholeFile => whole_file_lock(file, exclusive),
    }
}

fn unlock(file: &File, range: Range, backend: Backend) -> Result<()> {
    match backend {
        Backend::Ofd => ofd_unlock(file, range),
        Backend::WholeFile => whole_file_unlock(file),
    }
}

#[cfg(target_os = "linux")]
fn ofd_lock(file: &File, range: Range, exclusive: bool) -> Result<()> {
    let mut flock = libc::flock {
        l_type: if exclusive {
            libc::F_WRLCK as libc::c_short
        } else {
            libc::F_RDLCK as libc::c_short
        },
        l_whence: libc::SEEK_SET as libc::c_short,
        #[allow(clippy::cast_possible_wrap)]
        l_start: range.offset as libc::off_t,
        #[allow(clippy::cast_possible_wrap)]
        l_len: range.len as libc::off_t,
        l_pid: 0,
    };

    // SAFETY: fd is valid for the call, flock is fully initialized.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLKW, &mut flock) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn ofd_unlock(file: &File, range: Range) -> Result<()> {
    let mut flock = libc::flock {
        l_type: libc::F_UNLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        #[allow(clippy::cast_possible_wrap)]
        l_start: range.offset as libc::off_t,
        #[allow(clippy::cast_possible_wrap)]
        l_len: range.len as libc::off_t,
        l_pid: 0,
    };

    // SAFETY: fd is valid for the call, flock is fully initialized.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLK, &mut flock) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ofd_lock(_file: &File, _range: Range, _exclusive: bool) -> Result<()> {
    unreachable!("OFD backend is never selected off Linux")
}

#[cfg(not(target_os = "linux"))]
fn ofd_unlock(_file: &File, _range: Range) -> Result<()> {
    unreachable!("OFD backend is never selected off Linux")
}

fn whole_file_lock(file: &File, exclusive: bool) -> Result<()> {
    use fs2::FileExt;

    if exclusive {
        file.lock_exclusive()?;
    } else {
        file.lock_shared()?;
    }
    Ok(())
}

fn whole_file_unlock(file: &File) -> Result<()> {
    use fs2::FileExt;

    file.unlock()?;
    Ok(())
}
