//! KDL schema for config.kdl and the document-local `.tskfile.kdl`.
//!
//! This module provides:
//! - [`EngineConfig`], the Rust struct for the KDL schema
//! - Serialization/deserialization to/from KDL format
//! - Validation and reading from disk

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

use crate::storage::atomic::WriteDurability;
use crate::{Error, Result};

/// Name of the system-level config file.
pub const CONFIG_FILE_NAME: &str = "config.kdl";

/// Name of the config file placed next to a task file.
pub const LOCAL_CONFIG_FILE_NAME: &str = ".tskfile.kdl";

/// How changes to the task file on disk are noticed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Platform notification API
    #[default]
    Native,
    /// Periodic metadata polling
    Poll,
    /// Do not watch
    Off,
}

impl WatchMode {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "native" => Some(WatchMode::Native),
            "poll" => Some(WatchMode::Poll),
            "off" => Some(WatchMode::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchMode::Native => "native",
            WatchMode::Poll => "poll",
            WatchMode::Off => "off",
        }
    }
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine settings as stored in config.kdl.
///
/// Every field is optional so that files can be layered; see
/// [`crate::config::resolver`] for precedence.
///
/// # KDL Schema
///
/// ```kdl
/// lock-timeout-ms 5000
/// durability "durable"      // or "best-effort"
/// backups #true
/// backup-min-count 3
/// watch-mode "native"       // or "poll", "off"
/// poll-interval-ms 1000
/// backup-dir "/var/backups/tasks"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long to wait for another process's lock
    pub lock_timeout_ms: Option<u64>,

    /// Whether writes are flushed to stable storage before the rename
    pub durability: Option<WriteDurability>,

    /// Keep compressed copies of the file before overwriting it
    pub backups: Option<bool>,

    /// Minimum number of backups pruning leaves behind
    pub backup_min_count: Option<u32>,

    pub watch_mode: Option<WatchMode>,

    pub poll_interval_ms: Option<u64>,

    /// Backup root, defaults to the data directory
    pub backup_dir: Option<PathBuf>,
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(|entry| entry.value())
}

fn positive_integer(doc: &KdlDocument, name: &str) -> Option<u64> {
    first_value(doc, name)
        .and_then(KdlValue::as_integer)
        .and_then(|i| u64::try_from(i).ok())
}

fn push_node(doc: &mut KdlDocument, name: &str, value: KdlValue) {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(value));
    doc.nodes_mut().push(node);
}

impl EngineConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lock_timeout_ms == Some(0) {
            return Err("lock-timeout-ms must be greater than 0".to_string());
        }
        if self.poll_interval_ms == Some(0) {
            return Err("poll-interval-ms must be greater than 0".to_string());
        }
        if self.backup_min_count == Some(0) {
            return Err("backup-min-count must be at least 1".to_string());
        }
        Ok(())
    }

    /// Parse config from a KDL document. Unknown nodes and values of the
    /// wrong type are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        config.lock_timeout_ms = positive_integer(doc, "lock-timeout-ms");
        config.poll_interval_ms = positive_integer(doc, "poll-interval-ms");
        config.backup_min_count =
            positive_integer(doc, "backup-min-count").and_then(|i| u32::try_from(i).ok());

        if let Some(s) = first_value(doc, "durability").and_then(KdlValue::as_string) {
            config.durability = WriteDurability::parse(s);
        }
        if let Some(b) = first_value(doc, "backups").and_then(KdlValue::as_bool) {
            config.backups = Some(b);
        }
        if let Some(s) = first_value(doc, "watch-mode").and_then(KdlValue::as_string) {
            config.watch_mode = WatchMode::parse(s);
        }
        if let Some(s) = first_value(doc, "backup-dir").and_then(KdlValue::as_string) {
            config.backup_dir = Some(PathBuf::from(s));
        }

        config
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(ms) = self.lock_timeout_ms {
            push_node(&mut doc, "lock-timeout-ms", KdlValue::Integer(ms as i128));
        }
        if let Some(durability) = self.durability {
            push_node(
                &mut doc,
                "durability",
                KdlValue::String(durability.as_str().to_string()),
            );
        }
        if let Some(backups) = self.backups {
            push_node(&mut doc, "backups", KdlValue::Bool(backups));
        }
        if let Some(count) = self.backup_min_count {
            push_node(&mut doc, "backup-min-count", KdlValue::Integer(count as i128));
        }
        if let Some(mode) = self.watch_mode {
            push_node(&mut doc, "watch-mode", KdlValue::String(mode.as_str().to_string()));
        }
        if let Some(ms) = self.poll_interval_ms {
            push_node(&mut doc, "poll-interval-ms", KdlValue::Integer(ms as i128));
        }
        if let Some(ref dir) = self.backup_dir {
            push_node(
                &mut doc,
                "backup-dir",
                KdlValue::String(dir.display().to_string()),
            );
        }

        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &EngineConfig) {
        if other.lock_timeout_ms.is_some() {
            self.lock_timeout_ms = other.lock_timeout_ms;
        }
        if other.durability.is_some() {
            self.durability = other.durability;
        }
        if other.backups.is_some() {
            self.backups = other.backups;
        }
        if other.backup_min_count.is_some() {
            self.backup_min_count = other.backup_min_count;
        }
        if other.watch_mode.is_some() {
            self.watch_mode = other.watch_mode;
        }
        if other.poll_interval_ms.is_some() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.backup_dir.is_some() {
            self.backup_dir = other.backup_dir.clone();
        }
    }

    /// Read a config file. A missing file is an empty config.
    pub fn read_file(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: KdlDocument = text
            .parse()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_kdl(&doc);
        config
            .validate()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }
}
