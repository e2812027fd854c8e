//! Engine configuration.
//!
//! Settings live in KDL files:
//!
//! ## config.kdl - System-wide settings
//!
//! Located at `~/.config/tskfile/config.kdl` (`TSK_CONFIG_DIR` overrides
//! the directory).
//!
//! ## .tskfile.kdl - Document-local settings
//!
//! Placed next to a task file, applies to every task file in that
//! directory. Useful for turning off backups or durability on a scratch
//! folder.
//!
//! Both files share the schema in [`schema`]:
//! - `lock-timeout-ms` - How long to wait for another process's lock
//! - `durability` - "durable" or "best-effort"
//! - `backups` - Keep compressed copies before overwriting
//! - `backup-min-count` - Backups pruning always leaves
//! - `watch-mode` - "native", "poll" or "off"
//! - `poll-interval-ms` - Interval for the polling watcher
//! - `backup-dir` - Where backups go
//!
//! ## Precedence
//!
//! CLI flag > document-local file > system file > defaults
//!
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

use std::path::PathBuf;

pub use resolver::{ConfigOverrides, Resolved, ResolvedConfig, ValueSource, resolve_config};
pub use schema::{CONFIG_FILE_NAME, EngineConfig, LOCAL_CONFIG_FILE_NAME, WatchMode};

use crate::{Error, Result};

/// Environment variable overriding the system config directory.
pub const CONFIG_DIR_ENV: &str = "TSK_CONFIG_DIR";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TSK_DATA_DIR";

fn dir_from_env(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Directory holding the system config.kdl.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = dir_from_env(CONFIG_DIR_ENV) {
        return Ok(dir);
    }
    dirs::config_dir()
        .map(|dir| dir.join("tskfile"))
        .ok_or_else(|| Error::Other("Could not determine config directory".to_string()))
}

/// Directory for engine data such as backups.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = dir_from_env(DATA_DIR_ENV) {
        return Ok(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("tskfile"))
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))
}

/// Path of the system config.kdl.
pub fn system_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}
