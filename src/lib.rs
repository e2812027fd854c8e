//! tskfile - persistence and synchronization engine for `.tsk` task files.
//!
//! This library provides the core functionality for the `tsk` CLI tool:
//! atomic writes, the cooperative file lock, per-device change tracking,
//! the versioned XML reader and the [`storage::Document`] that ties them
//! together.

pub mod changes;
pub mod cli;
pub mod commands;
pub mod config;
pub mod models;
pub mod storage;
pub mod sys;

use std::path::PathBuf;
use std::time::Duration;


/// Library-level error type for task file operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("XML write error: {0}")]
    XmlWrite(#[from] quick_xml::Error),

    #[error("File format version {found} is newer than the supported version {supported}")]
    FormatTooNew { found: u32, supported: u32 },

    #[error("Timed out after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Could not lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock is held by live process {pid} on this host")]
    LockHeldByLiveProcess { pid: u32 },

    #[error("Could not write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not write {path}, its previous contents were left at {aside}: {source}")]
    WriteFailedMovedAside {
        path: PathBuf,
        aside: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document has no filename")]
    NoFilename,

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only lock contention qualifies; everything else needs user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

/// Result type alias for task file operations.
pub type Result<T> = std::result::Result<T, Error>;
