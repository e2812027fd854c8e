//! Compressed copies of a task file taken before it is overwritten.
//!
//! Layout under the backup root:
//!
//! ```text
//! backups.json                     sha → task file path
//! <sha>/YYYYMMDDHHMMSS.bak         gzip copy taken at that time
//! ```
//!
//! `<sha>` is the first 12 hex digits of the SHA-256 of the task file's
//! absolute path. Old backups are thinned out gradually: the number kept
//! grows with the logarithm of the age of the oldest one, and every save
//! removes at most a few of the backups closest in time to their neighbours.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Timelike};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::atomic::AtomicWriter;
use crate::models::values;
use crate::{Error, Result};

/// Backups pruning always leaves.
pub const DEFAULT_MIN_COUNT: u32 = 3;

/// Pruning removes at most this many backups per save.
pub const MAX_REMOVED_AT_ONCE: usize = 3;

const MANIFEST_FILE: &str = "backups.json";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One stored backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
    /// Compressed size in bytes
    pub size: u64,
}

impl BackupEntry {
    /// The id `restore` accepts.
    pub fn id(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, PathBuf>,
}

/// Backup store rooted at one directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    min_count: u32,
}

/// Absolute form of a document path, without requiring it to exist.
fn absolute(document: &Path) -> PathBuf {
    document
        .canonicalize()
        .or_else(|_| std::path::absolute(document))
        .unwrap_or_else(|_| document.to_path_buf())
}

/// Directory name for a document's backups.
pub fn document_hash(document: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(absolute(document).to_string_lossy().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    hash_hex[..12].to_string()
}

fn parse_backup_name(path: &Path) -> Option<NaiveDateTime> {
    if path.extension()? != "bak" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 14 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stem, TIMESTAMP_FORMAT).ok()
}

/// Number of backups worth keeping given the age of the oldest one.
pub fn max_backups(oldest: NaiveDateTime, now: NaiveDateTime, min_count: u32) -> usize {
    let minutes = (now - oldest).num_minutes().max(1) as f64;
    (min_count as usize).max(minutes.ln() as usize)
}

/// Index of the backup closest in time to both its neighbours. The oldest
/// and newest are never chosen.
fn least_unique(timestamps: &[NaiveDateTime]) -> Option<usize> {
    (1..timestamps.len().saturating_sub(1)).min_by_key(|&i| timestamps[i + 1] - timestamps[i - 1])
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            min_count: DEFAULT_MIN_COUNT,
        }
    }

    pub fn with_min_count(mut self, min_count: u32) -> Self {
        self.min_count = min_count.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the backups of one document.
    pub fn dir_for(&self, document: &Path) -> PathBuf {
        self.root.join(document_hash(document))
    }

    fn read_manifest(&self) -> Result<Manifest> {
        match fs::read_to_string(self.root.join(MANIFEST_FILE)) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn register(&self, document: &Path) -> Result<()> {
        let mut manifest = self.read_manifest().unwrap_or_else(|e| {
            warn!(error = %e, "Rebuilding unreadable backup manifest");
            Manifest::default()
        });
        let hash = document_hash(document);
        let path = absolute(document);
        if manifest.files.get(&hash) == Some(&path) {
            return Ok(());
        }
        manifest.files.insert(hash, path);
        let json = serde_json::to_vec_pretty(&manifest)?;
        AtomicWriter::new(self.root.join(MANIFEST_FILE)).write(&json)?;
        Ok(())
    }

    /// Documents that have backups, from the manifest.
    pub fn documents(&self) -> Result<Vec<PathBuf>> {
        Ok(self.read_manifest()?.files.into_values().collect())
    }

    /// Back up `document` if it exists, then prune.
    pub fn backup(&self, document: &Path) -> Result<Option<BackupEntry>> {
        self.backup_at(document, values::now())
    }

    pub fn backup_at(&self, document: &Path, now: NaiveDateTime) -> Result<Option<BackupEntry>> {
        let mut source = match File::open(document) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let dir = self.dir_for(document);
        fs::create_dir_all(&dir)?;
        self.register(document)?;

        let timestamp = now.with_nanosecond(0).unwrap_or(now);
        let path = dir.join(format!("{}.bak", timestamp.format(TIMESTAMP_FORMAT)));
        AtomicWriter::new(&path).write_with(|out| {
            let mut encoder = GzEncoder::new(out, Compression::default());
            io::copy(&mut source, &mut encoder)?;
            encoder.finish()?;
            Ok(())
        })?;
        let size = fs::metadata(&path)?.len();
        info!(document = %document.display(), backup = %path.display(), "Backed up task file");

        let removed = self.prune_at(document, now)?;
        if !removed.is_empty() {
            debug!(count = removed.len(), "Pruned old backups");
        }
        Ok(Some(BackupEntry {
            timestamp,
            path,
            size,
        }))
    }

    /// Backups of `document`, newest first.
    pub fn list(&self, document: &Path) -> Result<Vec<BackupEntry>> {
        let dir = self.dir_for(document);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(timestamp) = parse_backup_name(&path) else {
                continue;
            };
            backups.push(BackupEntry {
                timestamp,
                size: entry.metadata()?.len(),
                path,
            });
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    /// Remove superfluous backups, returning what was removed.
    pub fn prune_at(&self, document: &Path, now: NaiveDateTime) -> Result<Vec<PathBuf>> {
        let mut backups = self.list(document)?;
        backups.reverse();
        let Some(oldest) = backups.first().map(|b| b.timestamp) else {
            return Ok(Vec::new());
        };
        let keep = max_backups(oldest, now, self.min_count);
        let extraneous = backups.len().saturating_sub(keep);

        let mut removed = Vec::new();
        for _ in 0..extraneous.min(MAX_REMOVED_AT_ONCE) {
            let timestamps: Vec<NaiveDateTime> = backups.iter().map(|b| b.timestamp).collect();
            let Some(index) = least_unique(&timestamps) else {
                break;
            };
            let victim = backups.remove(index);
            if let Err(e) = fs::remove_file(&victim.path) {
                warn!(path = %victim.path.display(), error = %e, "Could not remove backup");
                continue;
            }
            removed.push(victim.path);
        }
        Ok(removed)
    }

    /// Decompress the backup taken at `timestamp` into `destination`.
    pub fn restore(
        &self,
        document: &Path,
        timestamp: NaiveDateTime,
        destination: &Path,
    ) -> Result<PathBuf> {
        let path = self
            .dir_for(document)
            .join(format!("{}.bak", timestamp.format(TIMESTAMP_FORMAT)));
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "backup {} of {}",
                    timestamp.format(TIMESTAMP_FORMAT),
                    document.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let written = AtomicWriter::new(destination).write_with(|out| {
            io::copy(&mut decoder, out)?;
            Ok(())
        })?;
        info!(backup = %path.display(), destination = %written.display(), "Restored backup");
        Ok(written)
    }
}

/// Parse a backup id as shown by `list` (`YYYYMMDDHHMMSS`).
pub fn parse_backup_id(id: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(id, TIMESTAMP_FORMAT)
        .map_err(|_| Error::InvalidInput(format!("not a backup id: {}", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use tempfile::TempDir;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn setup() -> (TempDir, BackupStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        let document = dir.path().join("work.tsk");
        (dir, store, document)
    }

    #[test]
    fn test_missing_document_is_not_backed_up() {
        let (_dir, store, document) = setup();
        assert!(store.backup(&document).unwrap().is_none());
        assert!(store.list(&document).unwrap().is_empty());
    }

    #[test]
    fn test_backup_and_restore() {
        let (dir, store, document) = setup();
        fs::write(&document, "<tasks/>").unwrap();

        let entry = store.backup_at(&document, at(1, 9, 30)).unwrap().unwrap();
        assert!(entry.path.ends_with("20240301093000.bak"));
        assert_eq!(store.documents().unwrap(), vec![absolute(&document)]);

        let restored = dir.path().join("restored.tsk");
        store.restore(&document, entry.timestamp, &restored).unwrap();
        assert_eq!(fs::read_to_string(restored).unwrap(), "<tasks/>");
    }

    #[test]
    fn test_restore_unknown_backup() {
        let (dir, store, document) = setup();
        let result = store.restore(&document, at(1, 0, 0), &dir.path().join("x"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_newest_first_ignores_strays() {
        let (_dir, store, document) = setup();
        fs::write(&document, "x").unwrap();
        store.backup_at(&document, at(1, 9, 0)).unwrap();
        store.backup_at(&document, at(2, 9, 0)).unwrap();
        fs::write(store.dir_for(&document).join("notes.txt"), "").unwrap();

        let listed = store.list(&document).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].timestamp, at(2, 9, 0));
    }

    #[test]
    fn test_max_backups_grows_logarithmically() {
        let start = at(1, 0, 0);
        assert_eq!(max_backups(start, start, 3), 3);
        // ln(7 days in minutes) ≈ 9.2
        assert_eq!(max_backups(start, start + Duration::days(7), 3), 9);
        assert_eq!(max_backups(start, start + Duration::days(7), 12), 12);
    }

    #[test]
    fn test_least_unique_skips_ends() {
        let times = vec![at(1, 0, 0), at(1, 0, 1), at(1, 0, 2), at(5, 0, 0)];
        assert_eq!(least_unique(&times), Some(1));
        assert_eq!(least_unique(&times[..2]), None);
    }

    #[test]
    fn test_prune_removes_at_most_three() {
        let (_dir, store, document) = setup();
        fs::write(&document, "x").unwrap();
        let dir = store.dir_for(&document);
        fs::create_dir_all(&dir).unwrap();
        for minute in 0..10 {
            let name = format!("{}.bak", at(1, 12, minute).format(TIMESTAMP_FORMAT));
            fs::write(dir.join(name), "").unwrap();
        }

        let removed = store.prune_at(&document, at(1, 12, 10)).unwrap();
        assert_eq!(removed.len(), MAX_REMOVED_AT_ONCE);
        let remaining = store.list(&document).unwrap();
        assert_eq!(remaining.len(), 7);
        assert_eq!(remaining.last().unwrap().timestamp, at(1, 12, 0));
        assert_eq!(remaining.first().unwrap().timestamp, at(1, 12, 9));
    }

    #[test]
    fn test_parse_backup_id() {
        assert_eq!(parse_backup_id("20240301093000").unwrap(), at(1, 9, 30));
        assert!(parse_backup_id("yesterday").is_err());

        let entry = BackupEntry {
            timestamp: at(1, 9, 30),
            path: PathBuf::from("20240301093000.bak"),
            size: 0,
        };
        assert_eq!(parse_backup_id(&entry.id()).unwrap(), entry.timestamp);
    }
}
