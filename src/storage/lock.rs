//! Cooperative inter-process lock on a task file.
//!
//! The lock lives next to the document as `<doc>.lock`. Its contents are
//! bookkeeping for humans and for [`FileLock::break_lock`]:
//! ```text
//! PID=12345
//! HOST=laptop
//! TOKEN=4a1c...
//! ```
//! Ownership is decided by atomic creation alone. On FUSE mounts exclusive
//! create is unreliable, so the lock is a directory instead (with the same
//! bookkeeping in `<doc>.lock/owner`). In sync-client folders a lock file
//! would itself be synced, so locking is a no-op there.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::models::new_id;
use crate::{Error, Result, sys};

/// How long [`FileLock::acquire`] waits unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A lock younger than this without readable bookkeeping is still being
/// written by its holder.
const WRITE_GRACE: Duration = Duration::from_secs(1);
const OWNER_FILE: &str = "owner";

/// How the lock is materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Exclusive create of `<doc>.lock`
    File,
    /// `mkdir <doc>.lock`, for FUSE mounts
    Directory,
    /// Nothing on disk, for cloud-synced folders
    Dummy,
}

impl LockStrategy {
    /// Pick the strategy for a document path.
    pub fn detect(document: &Path) -> Self {
        if sys::is_cloud_folder(document) {
            LockStrategy::Dummy
        } else if sys::is_fuse_mount(document) {
            LockStrategy::Directory
        } else {
            LockStrategy::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockStrategy::File => "file",
            LockStrategy::Directory => "directory",
            LockStrategy::Dummy => "dummy",
        }
    }
}

/// Who holds a lock, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub token: String,
}

impl LockInfo {
    fn current(token: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: sys::hostname(),
            token: token.to_string(),
        }
    }

    fn to_contents(&self) -> String {
        format!("PID={}\nHOST={}\nTOKEN={}\n", self.pid, self.host, self.token)
    }

    fn parse_contents(contents: &str) -> io::Result<Self> {
        let mut pid: Option<u32> = None;
        let mut host: Option<String> = None;
        let mut token: Option<String> = None;

        for line in contents.lines() {
            let line = line.trim();
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "PID" => {
                        pid = Some(value.parse().map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "Invalid PID value")
                        })?);
                    }
                    "HOST" => host = Some(value.to_string()),
                    "TOKEN" => token = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        let pid =
            pid.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing PID field"))?;
        Ok(Self {
            pid,
            host: host.unwrap_or_default(),
            token: token.unwrap_or_default(),
        })
    }

    /// Whether the holder is a running process on this machine.
    pub fn is_alive_here(&self) -> bool {
        self.host == sys::hostname() && sys::is_process_running(self.pid)
    }
}

/// A lock on one document. Dropping a held lock releases it.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    strategy: LockStrategy,
    token: String,
    held: bool,
}

/// `<doc>.lock` for a document path.
pub fn lock_path_for(document: &Path) -> PathBuf {
    let mut name = document
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    document.with_file_name(name)
}

impl FileLock {
    /// A lock for `document`, strategy detected from where it lives.
    pub fn for_document(document: &Path) -> Self {
        Self::with_strategy(document, LockStrategy::detect(document))
    }

    pub fn with_strategy(document: &Path, strategy: LockStrategy) -> Self {
        Self {
            lock_path: lock_path_for(document),
            strategy,
            token: new_id(),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Take the lock, polling until `timeout` elapses.
    ///
    /// Returns immediately when this instance already holds it.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        if self.held {
            return Ok(());
        }
        let started = Instant::now();
        loop {
            match self.try_acquire() {
                Ok(true) => {
                    self.held = true;
                    debug!(
                        path = %self.lock_path.display(),
                        strategy = self.strategy.as_str(),
                        "Acquired lock"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(Error::LockTimeout {
                            path: self.lock_path.clone(),
                            waited,
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(timeout - waited));
                }
                Err(source) => {
                    return Err(Error::LockFailed {
                        path: self.lock_path.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// One attempt. `Ok(false)` means someone else holds the lock.
    fn try_acquire(&self) -> io::Result<bool> {
        let info_path = match self.strategy {
            LockStrategy::Dummy => return Ok(true),
            LockStrategy::File => self.lock_path.clone(),
            LockStrategy::Directory => {
                match fs::create_dir(&self.lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
                    Err(e) => return Err(e),
                }
                self.lock_path.join(OWNER_FILE)
            }
        };

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&info_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                self.remove_on_disk();
                return Err(e);
            }
        };

        let contents = LockInfo::current(&self.token).to_contents();
        if let Err(e) = file
            .write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
        {
            self.remove_on_disk();
            return Err(e);
        }
        Ok(true)
    }

    /// Give the lock up. Does nothing when not held.
    ///
    /// A lock that was broken and re-taken by someone else is left alone.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        if self.strategy == LockStrategy::Dummy {
            return Ok(());
        }
        match self.holder() {
            Ok(Some(info)) if info.token != self.token => {
                warn!(path = %self.lock_path.display(), "Lock was taken over by another process");
                return Ok(());
            }
            _ => {}
        }
        self.remove_lock_path()?;
        debug!(path = %self.lock_path.display(), "Released lock");
        Ok(())
    }

    /// Whether anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        match self.strategy {
            LockStrategy::Dummy => self.held,
            LockStrategy::File | LockStrategy::Directory => self.lock_path.exists(),
        }
    }

    /// Whether this instance holds the lock and nobody broke it since.
    pub fn is_locked_by_me(&self) -> bool {
        if !self.held {
            return false;
        }
        match self.strategy {
            LockStrategy::Dummy => true,
            _ => matches!(self.holder(), Ok(Some(info)) if info.token == self.token),
        }
    }

    /// The recorded holder, `None` when unlocked.
    pub fn holder(&self) -> io::Result<Option<LockInfo>> {
        let info_path = match self.strategy {
            LockStrategy::Dummy => return Ok(None),
            LockStrategy::File => self.lock_path.clone(),
            LockStrategy::Directory => self.lock_path.join(OWNER_FILE),
        };
        match fs::read_to_string(&info_path) {
            Ok(contents) => LockInfo::parse_contents(&contents).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a stale lock left behind by a crashed process.
    ///
    /// Unless `force` is set, refuses when the recorded holder is still
    /// running on this host. Unreadable bookkeeping counts as stale once the
    /// lock is older than a second.
    pub fn break_lock(&mut self, force: bool) -> Result<()> {
        if self.strategy == LockStrategy::Dummy {
            return Ok(());
        }
        if !force {
            match self.holder() {
                Ok(Some(info)) => {
                    if info.token != self.token && info.is_alive_here() {
                        return Err(Error::LockHeldByLiveProcess { pid: info.pid });
                    }
                }
                _ if self.is_fresh() => {
                    return Err(Error::LockFailed {
                        path: self.lock_path.clone(),
                        source: io::Error::new(
                            io::ErrorKind::WouldBlock,
                            "lock is still being written by its holder",
                        ),
                    });
                }
                _ => {}
            }
        }
        self.remove_lock_path()?;
        self.held = false;
        info!(path = %self.lock_path.display(), force, "Broke lock");
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < WRITE_GRACE)
    }

    fn remove_lock_path(&self) -> Result<()> {
        let result = match self.strategy {
            LockStrategy::Dummy => Ok(()),
            LockStrategy::File => fs::remove_file(&self.lock_path),
            LockStrategy::Directory => fs::remove_dir_all(&self.lock_path),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::LockFailed {
                path: self.lock_path.clone(),
                source,
            }),
        }
    }

    fn remove_on_disk(&self) {
        if let Err(e) = self.remove_lock_path() {
            warn!(path = %self.lock_path.display(), error = %e, "Could not clean up partial lock");
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.lock_path.display(), error = %e, "Failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(dir: &TempDir) -> PathBuf {
        dir.path().join("todo.tsk")
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/todo.tsk")),
            PathBuf::from("/tmp/todo.tsk.lock")
        );
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        lock.acquire(Duration::ZERO).unwrap();
        assert!(lock.is_locked());
        assert!(lock.is_locked_by_me());

        let holder = lock.holder().unwrap().unwrap();
        assert_eq!(holder.pid, std::process::id());

        lock.release().unwrap();
        assert!(!lock.is_locked());
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_reacquire_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        lock.acquire(Duration::ZERO).unwrap();
        lock.acquire(Duration::ZERO).unwrap();
        assert!(lock.is_locked_by_me());
    }

    #[test]
    fn test_mutual_exclusion_times_out() {
        let dir = TempDir::new().unwrap();
        let mut first = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        let mut second = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        first.acquire(Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = second.acquire(Duration::from_millis(250)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(!second.is_locked_by_me());

        first.release().unwrap();
        second.acquire(Duration::ZERO).unwrap();
        assert!(second.is_locked_by_me());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = lock_path_for(&doc(&dir));
        {
            let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
            lock.acquire(Duration::ZERO).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_directory_strategy() {
        let dir = TempDir::new().unwrap();
        let mut first = FileLock::with_strategy(&doc(&dir), LockStrategy::Directory);
        let mut second = FileLock::with_strategy(&doc(&dir), LockStrategy::Directory);
        first.acquire(Duration::ZERO).unwrap();
        assert!(first.path().is_dir());
        assert!(second.acquire(Duration::ZERO).is_err());

        first.release().unwrap();
        assert!(!first.path().exists());
        second.acquire(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_dummy_strategy_never_touches_disk() {
        let dir = TempDir::new().unwrap();
        let mut first = FileLock::with_strategy(&doc(&dir), LockStrategy::Dummy);
        let mut second = FileLock::with_strategy(&doc(&dir), LockStrategy::Dummy);
        first.acquire(Duration::ZERO).unwrap();
        second.acquire(Duration::ZERO).unwrap();
        assert!(first.is_locked_by_me());
        assert!(!first.path().exists());
    }

    #[test]
    fn test_cloud_folder_selects_dummy() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".csync_journal.db"), b"").unwrap();
        assert_eq!(LockStrategy::detect(&doc(&dir)), LockStrategy::Dummy);
    }

    #[test]
    fn test_break_refuses_live_holder() {
        let dir = TempDir::new().unwrap();
        let mut holder = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        holder.acquire(Duration::ZERO).unwrap();

        let mut other = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        let err = other.break_lock(false).unwrap_err();
        assert!(matches!(err, Error::LockHeldByLiveProcess { .. }));
        assert!(!err.is_retryable());

        other.break_lock(true).unwrap();
        assert!(!holder.is_locked_by_me());
    }

    #[test]
    fn test_break_stale_lock() {
        let dir = TempDir::new().unwrap();
        let path = lock_path_for(&doc(&dir));
        fs::write(&path, "PID=4000000\nHOST=elsewhere\nTOKEN=abc\n").unwrap();

        let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        assert!(lock.is_locked());
        lock.break_lock(false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_break_refuses_lock_still_being_written() {
        let dir = TempDir::new().unwrap();
        let path = lock_path_for(&doc(&dir));
        fs::write(&path, "").unwrap();

        let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        let err = lock.break_lock(false).unwrap_err();
        assert!(matches!(err, Error::LockFailed { .. }));
        assert!(path.exists());

        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(10))
            .unwrap();
        lock.break_lock(false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_break_refuses_directory_lock_without_owner_yet() {
        let dir = TempDir::new().unwrap();
        let path = lock_path_for(&doc(&dir));
        fs::create_dir(&path).unwrap();

        let mut lock = FileLock::with_strategy(&doc(&dir), LockStrategy::Directory);
        assert!(lock.break_lock(false).is_err());
        assert!(path.is_dir());
        lock.break_lock(true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let mut mine = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        mine.acquire(Duration::ZERO).unwrap();

        let mut thief = FileLock::with_strategy(&doc(&dir), LockStrategy::File);
        thief.break_lock(true).unwrap();
        thief.acquire(Duration::ZERO).unwrap();

        mine.release().unwrap();
        assert!(thief.is_locked_by_me());
    }

    #[test]
    fn test_missing_directory_is_lock_failed() {
        let dir = TempDir::new().unwrap();
        let document = dir.path().join("missing").join("todo.tsk");
        let mut lock = FileLock::with_strategy(&document, LockStrategy::File);
        let err = lock.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockFailed { .. }));
    }

    #[test]
    fn test_parse_lock_info() {
        let info = LockInfo::parse_contents("PID=12\nHOST=box\nTOKEN=t\n").unwrap();
        assert_eq!(info.pid, 12);
        assert_eq!(info.host, "box");
        assert!(LockInfo::parse_contents("HOST=box\n").is_err());
    }
}
