//! Common test utilities for tsk integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't pollute
//! the user's config and data directories.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
pub use tempfile::TempDir;
use tskfile::config::{EngineConfig, WatchMode};
use tskfile::storage::{Document, LoadOptions};

/// A test environment with isolated directories.
///
/// Each `TestEnv` creates three temporary directories:
/// - `doc_dir`: Holds the task files and their sidecars
/// - `config_dir`: tsk's config (via `TSK_CONFIG_DIR`)
/// - `data_dir`: tsk's data, i.e. backups (via `TSK_DATA_DIR`)
///
/// The `tsk()` method returns a `Command` that sets both variables
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub doc_dir: TempDir,
    pub config_dir: TempDir,
    pub data_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment with isolated directories.
    pub fn new() -> Self {
        Self {
            doc_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the tsk binary with isolated directories.
    pub fn tsk(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_tsk"));
        cmd.current_dir(self.doc_dir.path());
        cmd.env("TSK_CONFIG_DIR", self.config_dir.path());
        cmd.env("TSK_DATA_DIR", self.data_dir.path());
        cmd.env("TSK_LOG", "off");
        cmd
    }

    /// Path of a file inside the document directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.doc_dir.path().join(name)
    }

    /// Write a task file and return its path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.file(name);
        fs::write(&path, contents).unwrap();
        path
    }

    /// Get the path to the document directory.
    pub fn path(&self) -> &Path {
        self.doc_dir.path()
    }

    /// Get the path to the data directory.
    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Engine config for in-process documents: short lock timeout, no
    /// watcher, backups in the isolated data directory.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout_ms: Some(300),
            backup_dir: Some(self.data_dir.path().join("backups")),
            watch_mode: Some(WatchMode::Off),
            ..EngineConfig::default()
        }
    }

    /// A fresh, unattached document.
    pub fn document(&self) -> Document {
        Document::new(self.config().into())
    }

    /// A document loaded from `name` in the document directory.
    pub fn open(&self, name: &str) -> Document {
        let mut doc = self.document();
        doc.load(&self.file(name), LoadOptions::default()).unwrap();
        doc
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A task file of the given format version wrapping `body`.
pub fn tsk_file(version: u32, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<?taskcoach release=\"1.0\" tskversion=\"{}\"?>\n<tasks>\n{}\n</tasks>\n",
        version, body
    )
}
