//! Command implementations for the tsk CLI.
//!
//! Each command returns a result type implementing [`CommandResult`]; the
//! binary prints it as JSON or, with `-H`, as text.
//!
//! - `info` / `check` - Read-only inspection of a task file
//! - `upgrade` / `import` - Load, edit and save through a [`Document`]
//! - `changes` - The `.delta` ledgers
//! - `lock` - Lock status and stale-lock removal
//! - `backups` - Listing and restoring backups
//! - `watch` - Follow changes made by other processes
//! - `config` - Effective settings with their sources

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::changes::SyncReport;
use crate::config::{ConfigOverrides, ResolvedConfig, resolve_config};
use crate::models::values;
use crate::storage::backup::{BackupEntry, BackupStore, parse_backup_id};
use crate::storage::lock::{FileLock, lock_path_for};
use crate::storage::xml::{self, ReadIssue, delta, reader};
use crate::storage::{Document, DocumentSettings, ImportReport, LoadOptions};
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait CommandResult {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

fn settings_for(file: &Path, overrides: &ConfigOverrides) -> Result<DocumentSettings> {
    Ok(resolve_config(Some(file), overrides)?.to_engine_config().into())
}

/// Run `op` on a loaded document, then close it so this process's change
/// ledger does not linger in the `.delta`.
fn with_document<R>(
    file: &Path,
    overrides: &ConfigOverrides,
    op: impl FnOnce(&mut Document) -> Result<R>,
) -> Result<R> {
    let mut doc = Document::new(settings_for(file, overrides)?);
    doc.load(file, LoadOptions::default())?;
    let result = op(&mut doc);
    let closed = doc.close();
    let value = result?;
    closed?;
    Ok(value)
}

fn require_file(file: &Path) -> Result<()> {
    if file.is_file() {
        Ok(())
    } else {
        Err(Error::NotFound(format!("task file {}", file.display())))
    }
}

// ---- info ----

#[derive(Serialize)]
pub struct InfoResult {
    pub path: PathBuf,
    pub version: u32,
    pub current_version: u32,
    pub guid: String,
    pub tasks: usize,
    pub categories: usize,
    pub notes: usize,
    pub efforts: usize,
    /// Devices with a ledger in the `.delta`
    pub devices: Vec<String>,
    pub locked: bool,
    pub issues: usize,
}

impl CommandResult for InfoResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("{}", self.path.display())];
        let version = if self.version < self.current_version {
            format!("{} (current is {})", self.version, self.current_version)
        } else {
            self.version.to_string()
        };
        lines.push(format!("  Format version: {}", version));
        lines.push(format!("  GUID: {}", self.guid));
        lines.push(format!(
            "  Tasks: {}  Categories: {}  Notes: {}  Efforts: {}",
            self.tasks, self.categories, self.notes, self.efforts
        ));
        lines.push(format!("  Devices sharing: {}", self.devices.len()));
        if self.locked {
            lines.push("  Locked: yes".to_string());
        }
        if self.issues > 0 {
            lines.push(format!("  Issues: {} (run `tsk check`)", self.issues));
        }
        lines.join("\n")
    }
}

/// Summarize a task file without registering as a device.
pub fn info(file: &Path) -> Result<InfoResult> {
    require_file(file)?;
    let parsed = reader::read_file(file)?;
    Ok(InfoResult {
        path: file.to_path_buf(),
        version: parsed.version,
        current_version: xml::CURRENT_VERSION,
        guid: parsed.guid,
        tasks: parsed.tasks.len(),
        categories: parsed.categories.len(),
        notes: parsed.notes.len(),
        efforts: parsed.tasks.iter().map(|t| t.efforts.len()).sum(),
        devices: parsed.changes.keys().cloned().collect(),
        locked: FileLock::for_document(file).is_locked(),
        issues: parsed.issues.len(),
    })
}

// ---- check ----

#[derive(Serialize)]
pub struct CheckResult {
    pub path: PathBuf,
    pub version: u32,
    pub ok: bool,
    pub issues: Vec<ReadIssue>,
}

impl CommandResult for CheckResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.ok {
            return format!("{}: OK (version {})", self.path.display(), self.version);
        }
        let mut lines = vec![format!(
            "{}: {} issue(s) (version {})",
            self.path.display(),
            self.issues.len(),
            self.version
        )];
        for issue in &self.issues {
            lines.push(format!("  {}", issue));
        }
        lines.join("\n")
    }
}

pub fn check(file: &Path) -> Result<CheckResult> {
    require_file(file)?;
    let parsed = reader::read_file(file)?;
    Ok(CheckResult {
        path: file.to_path_buf(),
        version: parsed.version,
        ok: parsed.issues.is_empty(),
        issues: parsed.issues,
    })
}

// ---- upgrade ----

#[derive(Serialize)]
pub struct UpgradeResult {
    pub path: PathBuf,
    pub from_version: u32,
    pub to_version: u32,
    /// Changes from other devices merged while saving
    pub merged: usize,
}

impl CommandResult for UpgradeResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.from_version == self.to_version {
            format!(
                "Rewrote {} (already version {})",
                self.path.display(),
                self.to_version
            )
        } else {
            format!(
                "Upgraded {} from version {} to {}",
                self.path.display(),
                self.from_version,
                self.to_version
            )
        }
    }
}

/// Rewrite a task file in the current format.
pub fn upgrade(file: &Path, overrides: &ConfigOverrides) -> Result<UpgradeResult> {
    require_file(file)?;
    with_document(file, overrides, |doc| {
        let from_version = doc.last_report().version;
        doc.mark_dirty(true);
        let report = doc.save()?;
        Ok(UpgradeResult {
            path: file.to_path_buf(),
            from_version,
            to_version: xml::CURRENT_VERSION,
            merged: report.mutation_count(),
        })
    })
}

// ---- import ----

#[derive(Serialize)]
pub struct ImportResult {
    pub path: PathBuf,
    pub from: PathBuf,
    #[serde(flatten)]
    pub report: ImportReport,
}

impl CommandResult for ImportResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "Imported {} object(s) from {} into {}",
            self.report.added,
            self.from.display(),
            self.path.display()
        )];
        if !self.report.replaced.is_empty() {
            lines.push(format!("  Replaced: {}", self.report.replaced.join(", ")));
        }
        for issue in &self.report.issues {
            lines.push(format!("  {}", issue));
        }
        lines.join("\n")
    }
}

pub fn import(file: &Path, other: &Path, overrides: &ConfigOverrides) -> Result<ImportResult> {
    require_file(other)?;
    with_document(file, overrides, |doc| {
        let report = doc.import(other)?;
        doc.save()?;
        Ok(ImportResult {
            path: file.to_path_buf(),
            from: other.to_path_buf(),
            report,
        })
    })
}

// ---- changes ----

#[derive(Serialize)]
pub struct ChangesResult {
    pub path: PathBuf,
    /// Device GUID → object id → changed attribute names
    pub devices: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl CommandResult for ChangesResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.devices.is_empty() {
            return format!("{}: no change ledgers", self.path.display());
        }
        let mut lines = Vec::new();
        for (device, objects) in &self.devices {
            lines.push(format!("Device {} ({} pending)", device, objects.len()));
            for (id, names) in objects {
                lines.push(format!("  {}: {}", id, names.join(", ")));
            }
        }
        lines.join("\n")
    }
}

pub fn changes(file: &Path) -> Result<ChangesResult> {
    let map = delta::read_file(&delta::delta_path_for(file));
    let devices = map
        .iter()
        .map(|(guid, ledger)| {
            let objects = ledger
                .all_changes()
                .iter()
                .filter(|(_, names)| !names.is_empty())
                .map(|(id, names)| (id.clone(), names.iter().cloned().collect()))
                .collect();
            (guid.clone(), objects)
        })
        .collect();
    Ok(ChangesResult {
        path: file.to_path_buf(),
        devices,
    })
}

// ---- lock ----

#[derive(Serialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: String,
    /// Only known for holders on this host
    pub alive: Option<bool>,
}

#[derive(Serialize)]
pub struct LockStatusResult {
    pub path: PathBuf,
    pub lock_path: PathBuf,
    pub strategy: String,
    pub locked: bool,
    pub holder: Option<LockHolder>,
}

impl CommandResult for LockStatusResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if !self.locked {
            return format!("{}: not locked ({} lock)", self.path.display(), self.strategy);
        }
        match &self.holder {
            Some(holder) => {
                let state = match holder.alive {
                    Some(true) => "running",
                    Some(false) => "not running, stale",
                    None => "on another host",
                };
                format!(
                    "{}: locked by pid {} on {} ({})",
                    self.path.display(),
                    holder.pid,
                    holder.host,
                    state
                )
            }
            None => format!("{}: locked (holder unknown)", self.path.display()),
        }
    }
}

pub fn lock_status(file: &Path) -> Result<LockStatusResult> {
    let lock = FileLock::for_document(file);
    let holder = lock.holder()?.map(|info| LockHolder {
        alive: (info.host == crate::sys::hostname()).then(|| info.is_alive_here()),
        pid: info.pid,
        host: info.host,
    });
    Ok(LockStatusResult {
        path: file.to_path_buf(),
        lock_path: lock_path_for(file),
        strategy: lock.strategy().as_str().to_string(),
        locked: lock.is_locked(),
        holder,
    })
}

#[derive(Serialize)]
pub struct LockBreakResult {
    pub path: PathBuf,
    pub broken: bool,
}

impl CommandResult for LockBreakResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.broken {
            format!("Removed lock on {}", self.path.display())
        } else {
            format!("{} was not locked", self.path.display())
        }
    }
}

pub fn lock_break(file: &Path, force: bool) -> Result<LockBreakResult> {
    let mut lock = FileLock::for_document(file);
    let was_locked = lock.is_locked();
    lock.break_lock(force)?;
    Ok(LockBreakResult {
        path: file.to_path_buf(),
        broken: was_locked,
    })
}

// ---- backups ----

fn backup_store(file: &Path, overrides: &ConfigOverrides) -> Result<BackupStore> {
    let config = resolve_config(Some(file), overrides)?;
    let dir = config
        .backup_dir
        .ok_or_else(|| Error::Config("no backup directory could be determined".to_string()))?;
    Ok(BackupStore::new(dir.value).with_min_count(config.backup_min_count.value))
}

#[derive(Serialize)]
pub struct BackupView {
    pub id: String,
    #[serde(flatten)]
    pub entry: BackupEntry,
}

#[derive(Serialize)]
pub struct BackupListResult {
    pub path: PathBuf,
    pub backups: Vec<BackupView>,
}

impl CommandResult for BackupListResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.backups.is_empty() {
            return format!("No backups of {}", self.path.display());
        }
        let mut lines = vec![format!(
            "{} backup(s) of {}:",
            self.backups.len(),
            self.path.display()
        )];
        for backup in &self.backups {
            lines.push(format!(
                "  {}  {}  {} bytes",
                backup.id,
                backup.entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                backup.entry.size
            ));
        }
        lines.join("\n")
    }
}

pub fn backups_list(file: &Path, overrides: &ConfigOverrides) -> Result<BackupListResult> {
    let store = backup_store(file, overrides)?;
    let backups = store
        .list(file)?
        .into_iter()
        .map(|entry| BackupView {
            id: entry.id(),
            entry,
        })
        .collect();
    Ok(BackupListResult {
        path: file.to_path_buf(),
        backups,
    })
}

#[derive(Serialize)]
pub struct BackupRestoreResult {
    pub path: PathBuf,
    pub id: String,
    pub restored_to: PathBuf,
}

impl CommandResult for BackupRestoreResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Restored backup {} to {}", self.id, self.restored_to.display())
    }
}

/// Restore a backup, over the task file unless `output` is given. The
/// current contents are backed up first.
pub fn backups_restore(
    file: &Path,
    id: &str,
    output: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<BackupRestoreResult> {
    let timestamp = parse_backup_id(id)?;
    let store = backup_store(file, overrides)?;
    let destination = output.unwrap_or(file);

    let mut lock = FileLock::for_document(destination);
    let timeout =
        Duration::from_millis(resolve_config(Some(file), overrides)?.lock_timeout_ms.value);
    lock.acquire(timeout)?;
    let result = (|| {
        if destination == file {
            store.backup(file)?;
        }
        store.restore(file, timestamp, destination)
    })();
    lock.release()?;

    Ok(BackupRestoreResult {
        path: file.to_path_buf(),
        id: id.to_string(),
        restored_to: result?,
    })
}

// ---- watch ----

/// One change seen by `tsk watch`.
#[derive(Serialize)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub seen_at: String,
    /// What merging the change brought in, with `--merge`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<SyncReport>,
}

impl CommandResult for WatchEvent {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut line = format!("{} changed at {}", self.path.display(), self.seen_at);
        if let Some(report) = &self.merged {
            line.push_str(&format!(
                ": {} added, {} removed, {} updated",
                report.added.len(),
                report.removed.len(),
                report.updated.len()
            ));
        }
        line
    }
}

#[derive(Serialize)]
pub struct WatchSummary {
    pub path: PathBuf,
    pub changes: usize,
}

impl CommandResult for WatchSummary {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Stopped watching {} after {} change(s)",
            self.path.display(),
            self.changes
        )
    }
}

/// Follow a task file until `stop` is raised, calling `on_change` for every
/// change another process makes.
pub fn watch(
    file: &Path,
    merge: bool,
    overrides: &ConfigOverrides,
    stop: &AtomicBool,
    mut on_change: impl FnMut(&WatchEvent),
) -> Result<WatchSummary> {
    let tick = Duration::from_millis(250);
    with_document(file, overrides, |doc| {
        let mut changes = 0;
        while !stop.load(Ordering::SeqCst) {
            if !doc.wait_for_disk_change(tick) {
                continue;
            }
            let merged = if merge {
                Some(doc.merge_disk_changes()?)
            } else {
                None
            };
            changes += 1;
            on_change(&WatchEvent {
                path: file.to_path_buf(),
                seen_at: values::format_datetime(&values::now()),
                merged,
            });
        }
        Ok(WatchSummary {
            path: file.to_path_buf(),
            changes,
        })
    })
}

// ---- config ----

#[derive(Serialize)]
pub struct ConfigShowResult {
    pub document: Option<PathBuf>,
    #[serde(flatten)]
    pub config: ResolvedConfig,
}

impl CommandResult for ConfigShowResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let c = &self.config;
        let mut lines = vec![
            format!("lock-timeout-ms = {} ({})", c.lock_timeout_ms.value, c.lock_timeout_ms.source),
            format!("durability = {} ({})", c.durability.value, c.durability.source),
            format!("backups = {} ({})", c.backups.value, c.backups.source),
            format!(
                "backup-min-count = {} ({})",
                c.backup_min_count.value, c.backup_min_count.source
            ),
            format!("watch-mode = {} ({})", c.watch_mode.value, c.watch_mode.source),
            format!(
                "poll-interval-ms = {} ({})",
                c.poll_interval_ms.value, c.poll_interval_ms.source
            ),
        ];
        match &c.backup_dir {
            Some(dir) => lines.push(format!(
                "backup-dir = {} ({})",
                dir.value.display(),
                dir.source
            )),
            None => lines.push("backup-dir = (none)".to_string()),
        }
        lines.join("\n")
    }
}

pub fn config_show(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<ConfigShowResult> {
    Ok(ConfigShowResult {
        document: file.map(Path::to_path_buf),
        config: resolve_config(file, overrides)?,
    })
}
