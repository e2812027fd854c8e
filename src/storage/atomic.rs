//! Crash-safe replacement of a file's contents.
//!
//! Contents go to a uniquely named temporary file in the target's directory
//! and are renamed over the target. A reader never observes a partially
//! written file: it sees either the old contents or the new ones.
//!
//! Inside folders managed by a sync client (Dropbox, ownCloud) renames show
//! up as delete + create and confuse the client, so there the target is
//! written in place instead.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result, sys};

/// How hard a write tries to reach stable storage before returning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteDurability {
    /// Rename into place without forcing data to disk.
    BestEffort,
    /// `fsync` the file before the rename and the directory after it.
    #[default]
    Durable,
}

impl WriteDurability {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "durable" => Some(WriteDurability::Durable),
            "best-effort" | "besteffort" | "fast" => Some(WriteDurability::BestEffort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDurability::BestEffort => "best-effort",
            WriteDurability::Durable => "durable",
        }
    }
}

impl std::fmt::Display for WriteDurability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Writes one target file atomically.
#[derive(Debug, Clone)]
pub struct AtomicWriter {
    target: PathBuf,
    durability: WriteDurability,
    direct: bool,
}

impl AtomicWriter {
    /// A writer for `target`. Cloud-folder detection happens here.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let direct = sys::is_cloud_folder(&target);
        if direct {
            debug!(path = %target.display(), "Target is in a cloud folder, writing in place");
        }
        Self {
            target,
            durability: WriteDurability::default(),
            direct,
        }
    }

    pub fn with_durability(mut self, durability: WriteDurability) -> Self {
        self.durability = durability;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Whether writes bypass the temp-file-and-rename path.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Replace the target's contents with `contents`. Returns the target.
    pub fn write(&self, contents: &[u8]) -> Result<PathBuf> {
        self.write_with(|out| {
            out.write_all(contents)
                .map_err(|source| self.write_failed(source))
        })
    }

    /// Replace the target's contents with whatever `fill` writes.
    ///
    /// If `fill` fails the target is untouched and the temporary file is
    /// removed; the error from `fill` is returned as is.
    pub fn write_with<F>(&self, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        if self.direct {
            self.write_in_place(fill)?;
            return Ok(self.target.clone());
        }

        let dir = self.directory();
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", self.file_name()))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|source| self.write_failed(source))?;

        {
            let mut out = BufWriter::new(temp.as_file_mut());
            fill(&mut out)?;
            out.flush().map_err(|source| self.write_failed(source))?;
        }
        if self.durability == WriteDurability::Durable {
            temp.as_file()
                .sync_all()
                .map_err(|source| self.write_failed(source))?;
        }

        match temp.persist(&self.target) {
            Ok(_) => {}
            Err(err) => {
                warn!(
                    path = %self.target.display(),
                    error = %err.error,
                    "Atomic rename failed, falling back to move-aside replace"
                );
                self.replace_moving_aside(err.file)?;
            }
        }

        if self.durability == WriteDurability::Durable {
            sync_directory(&dir);
        }
        debug!(path = %self.target.display(), "Wrote file atomically");
        Ok(self.target.clone())
    }

    fn write_in_place<F>(&self, fill: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        // Render fully before truncating the target
        let mut buffer = Vec::new();
        fill(&mut buffer)?;

        let mut file = File::create(&self.target).map_err(|source| self.write_failed(source))?;
        file.write_all(&buffer)
            .map_err(|source| self.write_failed(source))?;
        if self.durability == WriteDurability::Durable {
            file.sync_all().map_err(|source| self.write_failed(source))?;
        }
        debug!(path = %self.target.display(), "Wrote file in place");
        Ok(())
    }

    /// Non-atomic fallback: move the old target to `name (N).ext`, put the
    /// temp file in its place, then drop the old copy.
    fn replace_moving_aside(&self, temp: tempfile::NamedTempFile) -> Result<()> {
        // A failed persist drops the temporary file, which deletes it
        self.swap_in(
            |target| temp.persist(target).map(drop).map_err(|err| err.error),
            |aside, target| fs::rename(aside, target),
        )
    }

    fn swap_in<P, R>(&self, place: P, restore: R) -> Result<()>
    where
        P: FnOnce(&Path) -> io::Result<()>,
        R: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let aside = if self.target.exists() {
            let aside = unique_sibling(&self.target);
            fs::rename(&self.target, &aside).map_err(|source| self.write_failed(source))?;
            Some(aside)
        } else {
            None
        };

        let source = match place(&self.target) {
            Ok(()) => {
                if let Some(aside) = aside {
                    if let Err(e) = fs::remove_file(&aside) {
                        warn!(
                            path = %aside.display(),
                            error = %e,
                            "Could not remove replaced file"
                        );
                    }
                }
                return Ok(());
            }
            Err(source) => source,
        };

        let Some(aside) = aside else {
            return Err(self.write_failed(source));
        };
        match restore(&aside, &self.target) {
            Ok(()) => Err(self.write_failed(source)),
            Err(e) => {
                warn!(
                    path = %self.target.display(),
                    aside = %aside.display(),
                    error = %e,
                    "Could not restore original file"
                );
                Err(Error::WriteFailedMovedAside {
                    path: self.target.clone(),
                    aside,
                    source,
                })
            }
        }
    }

    fn directory(&self) -> PathBuf {
        match self.target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn file_name(&self) -> String {
        self.target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }

    fn write_failed(&self, source: io::Error) -> Error {
        Error::WriteFailed {
            path: self.target.clone(),
            source,
        }
    }
}

/// `dir/name (1).ext`, `dir/name (2).ext`, ... whichever does not exist yet.
fn unique_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    (1..)
        .map(|n| dir.join(format!("{} ({}){}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| dir.join(format!("{}.old{}", stem, ext)))
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}
