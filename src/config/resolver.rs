//! Precedence resolution for engine settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Document-local `.tskfile.kdl` next to the task file
//! 3. System config.kdl (`~/.config/tskfile/config.kdl`)
//! 4. Built-in defaults

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::schema::{EngineConfig, LOCAL_CONFIG_FILE_NAME, WatchMode};
use crate::Result;
use crate::storage::atomic::WriteDurability;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BACKUP_MIN_COUNT: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Value from the `.tskfile.kdl` next to the document
    Document,
    /// Value from system-level config
    System,
    /// Value from CLI flag
    #[serde(rename = "cli")]
    CliFlag,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Document => write!(f, "document"),
            ValueSource::System => write!(f, "system"),
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// First value present in precedence order, else the default.
fn pick<T: Clone>(
    cli: &Option<T>,
    document: &Option<T>,
    system: &Option<T>,
    default: T,
) -> Resolved<T> {
    if let Some(v) = cli {
        Resolved::new(v.clone(), ValueSource::CliFlag)
    } else if let Some(v) = document {
        Resolved::new(v.clone(), ValueSource::Document)
    } else if let Some(v) = system {
        Resolved::new(v.clone(), ValueSource::System)
    } else {
        Resolved::new(default, ValueSource::Default)
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub lock_timeout_ms: Resolved<u64>,
    pub durability: Resolved<WriteDurability>,
    pub backups: Resolved<bool>,
    pub backup_min_count: Resolved<u32>,
    pub watch_mode: Resolved<WatchMode>,
    pub poll_interval_ms: Resolved<u64>,
    /// Absent when no data directory can be determined
    pub backup_dir: Option<Resolved<PathBuf>>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: Resolved::new(DEFAULT_LOCK_TIMEOUT_MS, ValueSource::Default),
            durability: Resolved::new(WriteDurability::default(), ValueSource::Default),
            backups: Resolved::new(true, ValueSource::Default),
            backup_min_count: Resolved::new(DEFAULT_BACKUP_MIN_COUNT, ValueSource::Default),
            watch_mode: Resolved::new(WatchMode::default(), ValueSource::Default),
            poll_interval_ms: Resolved::new(DEFAULT_POLL_INTERVAL_MS, ValueSource::Default),
            backup_dir: default_backup_dir(),
        }
    }
}

fn default_backup_dir() -> Option<Resolved<PathBuf>> {
    super::data_dir()
        .ok()
        .map(|dir| Resolved::new(dir.join("backups"), ValueSource::Default))
}

impl ResolvedConfig {
    /// The effective values as a fully populated [`EngineConfig`].
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout_ms: Some(self.lock_timeout_ms.value),
            durability: Some(self.durability.value),
            backups: Some(self.backups.value),
            backup_min_count: Some(self.backup_min_count.value),
            watch_mode: Some(self.watch_mode.value),
            poll_interval_ms: Some(self.poll_interval_ms.value),
            backup_dir: self.backup_dir.as_ref().map(|r| r.value.clone()),
        }
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: EngineConfig,
}

impl ConfigOverrides {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = Some(ms);
        self
    }

    pub fn with_durability(mut self, durability: WriteDurability) -> Self {
        self.config.durability = Some(durability);
        self
    }

    pub fn with_backups(mut self, enabled: bool) -> Self {
        self.config.backups = Some(enabled);
        self
    }

    pub fn with_watch_mode(mut self, mode: WatchMode) -> Self {
        self.config.watch_mode = Some(mode);
        self
    }
}

/// Path of the document-local config for a task file.
pub fn local_config_path(document: &Path) -> Option<PathBuf> {
    let dir = document.parent()?;
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    Some(dir.join(LOCAL_CONFIG_FILE_NAME))
}

/// Resolve configuration with full precedence chain.
///
/// `document` selects the document-local config; without it only the
/// system file and defaults apply below the CLI flags.
pub fn resolve_config(
    document: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig> {
    let system = EngineConfig::read_file(&super::system_config_path()?)?;
    let local = match document.and_then(local_config_path) {
        Some(path) => EngineConfig::read_file(&path)?,
        None => EngineConfig::default(),
    };
    let cli = &overrides.config;
    let defaults = ResolvedConfig::default();

    let backup_dir = if let Some(dir) = &cli.backup_dir {
        Some(Resolved::new(dir.clone(), ValueSource::CliFlag))
    } else if let Some(dir) = &local.backup_dir {
        Some(Resolved::new(dir.clone(), ValueSource::Document))
    } else if let Some(dir) = &system.backup_dir {
        Some(Resolved::new(dir.clone(), ValueSource::System))
    } else {
        defaults.backup_dir
    };

    Ok(ResolvedConfig {
        lock_timeout_ms: pick(
            &cli.lock_timeout_ms,
            &local.lock_timeout_ms,
            &system.lock_timeout_ms,
            DEFAULT_LOCK_TIMEOUT_MS,
        ),
        durability: pick(
            &cli.durability,
            &local.durability,
            &system.durability,
            WriteDurability::default(),
        ),
        backups: pick(&cli.backups, &local.backups, &system.backups, true),
        backup_min_count: pick(
            &cli.backup_min_count,
            &local.backup_min_count,
            &system.backup_min_count,
            DEFAULT_BACKUP_MIN_COUNT,
        ),
        watch_mode: pick(
            &cli.watch_mode,
            &local.watch_mode,
            &system.watch_mode,
            WatchMode::default(),
        ),
        poll_interval_ms: pick(
            &cli.poll_interval_ms,
            &local.poll_interval_ms,
            &system.poll_interval_ms,
            DEFAULT_POLL_INTERVAL_MS,
        ),
        backup_dir,
    })
}
