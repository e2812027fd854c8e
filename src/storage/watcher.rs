//! Notice when a task file changes on disk.
//!
//! The notification callback runs on a thread owned by `notify`; it only
//! raises a flag and sends on a channel. The document owner polls.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, SystemTime};

use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::WatchMode;
use crate::{Error, Result};

/// Quiet period after an event before [`FileWatcher::wait`] returns.
const DEBOUNCE_MS: u64 = 100;

/// Identity of a file's contents as far as metadata can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl Fingerprint {
    /// `None` when the file does not exist.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Watches one file through its parent directory, so that atomic
/// replacement (a new inode) keeps being noticed.
pub struct FileWatcher {
    path: PathBuf,
    mode: WatchMode,
    changed: Arc<AtomicBool>,
    events: Receiver<()>,
    _watcher: Box<dyn Watcher + Send>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("changed", &self.changed.load(Ordering::SeqCst))
            .finish()
    }
}

fn is_relevant(event: &Event, name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(name.as_os_str()))
}

fn notify_error(path: &Path, e: notify::Error) -> Error {
    Error::Other(format!("Could not watch {}: {}", path.display(), e))
}

impl FileWatcher {
    /// Start watching `path`. Returns `None` for [`WatchMode::Off`].
    pub fn start(path: &Path, mode: WatchMode, poll_interval: Duration) -> Result<Option<Self>> {
        if mode == WatchMode::Off {
            return Ok(None);
        }
        let name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let changed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let flag = Arc::clone(&changed);
        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &name) => {
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "File watcher error"),
        };

        let mut watcher: Box<dyn Watcher + Send> = match mode {
            WatchMode::Poll => Box::new(
                PollWatcher::new(handler, Config::default().with_poll_interval(poll_interval))
                    .map_err(|e| notify_error(path, e))?,
            ),
            _ => Box::new(
                RecommendedWatcher::new(handler, Config::default())
                    .map_err(|e| notify_error(path, e))?,
            ),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| notify_error(path, e))?;
        debug!(path = %path.display(), mode = %mode, "Watching task file");

        Ok(Some(Self {
            path: path.to_path_buf(),
            mode,
            changed,
            events: rx,
            _watcher: watcher,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Whether a change was seen since the last [`FileWatcher::take_changed`].
    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Read and clear the change flag.
    pub fn take_changed(&self) -> bool {
        while self.events.try_recv().is_ok() {}
        self.changed.swap(false, Ordering::SeqCst)
    }

    /// Forget pending events, e.g. the ones caused by our own save.
    pub fn drain(&self) {
        self.take_changed();
    }

    /// Block until a change arrives and things have been quiet for a
    /// moment, or until `timeout` passes. Returns whether a change was seen.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                return self.has_changed();
            }
        }
        let debounce = Duration::from_millis(DEBOUNCE_MS);
        while self.events.recv_timeout(debounce).is_ok() {}
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_off_mode_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let watcher =
            FileWatcher::start(&dir.path().join("a.tsk"), WatchMode::Off, Duration::ZERO).unwrap();
        assert!(watcher.is_none());
    }

    #[test]
    fn test_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsk");
        assert!(Fingerprint::of(&path).is_none());
        fs::write(&path, "one").unwrap();
        let first = Fingerprint::of(&path).unwrap();
        assert_eq!(first.len, 3);
        fs::write(&path, "three").unwrap();
        assert_ne!(Fingerprint::of(&path).unwrap(), first);
    }

    #[test]
    fn test_poll_watcher_sees_changes_to_the_file_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsk");
        fs::write(&path, "one").unwrap();
        let watcher = FileWatcher::start(&path, WatchMode::Poll, Duration::from_millis(50))
            .unwrap()
            .unwrap();

        fs::write(dir.path().join("other.txt"), "noise").unwrap();
        assert!(!watcher.wait(Duration::from_millis(300)));

        fs::write(&path, "changed contents").unwrap();
        assert!(watcher.wait(Duration::from_secs(5)));
        assert!(watcher.take_changed());
        assert!(!watcher.has_changed());
    }
}
