// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fmt;

/// Errors surfaced by the core engine.
///
/// Every public fallible operation returns [`Result<T>`]. The HTTP and CLI
/// adapters translate these into their own status codes; see the crate's
/// `server`/`cli` modules.
#[derive(Debug)]
pub enum Error {
    /// A key (or internal node ID) was not found.
    NotFound,

    /// The underlying forest search failed.
    SearchError(String),

    /// A search deadline expired before a result was produced.
    Timeout,

    /// An apply cycle found no binlog rows at or before its cutoff.
    TargetNotExist,

    /// A lock acquisition, read, or write failed.
    Io(std::io::Error),

    /// A structural inconsistency was detected during traversal.
    Invariant(String),

    /// The key/id CSV map file was malformed.
    Csv(csv::Error),

    /// The binlog (SQLite) backend failed.
    Binlog(rusqlite::Error),

    /// A features payload could not be decoded as JSON.
    Json(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::SearchError(msg) => write!(f, "search failed: {msg}"),
            Self::Timeout => write!(f, "search deadline exceeded"),
            Self::TargetNotExist => write!(f, "no binlog rows at or before cutoff"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Invariant(msg) => write!(f, "invariant violated: {msg}"),
            Self::Csv(e) => write!(f, "key map error: {e}"),
            Self::Binlog(e) => write!(f, "binlog error: {e}"),
            Self::Json(msg) => write!(f, "malformed features payload: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Csv(e) => Some(e),
            Self::Binlog(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<csv::Error> for Error {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Binlog(value)
    }
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
