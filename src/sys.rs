//! System utilities for filesystem and process probes.
//!
//! The writer and the lock change strategy depending on where the task file
//! lives: sync-client folders (Dropbox, ownCloud) get direct writes and no
//! lock, FUSE mounts get directory-based locks.

use std::path::{Path, PathBuf};

/// Marker files left behind by sync clients at the root of a synced folder.
pub const CLOUD_MARKERS: &[&str] = &[".dropbox.cache", ".csync_journal.db"];

/// Returns the synced folder root if `path` lives inside a sync-client folder.
///
/// Walks from the directory containing `path` towards the filesystem root
/// and stops at the first directory holding one of [`CLOUD_MARKERS`].
///
/// # Examples
///
/// ```no_run
/// use tskfile::sys::cloud_folder_root;
///
/// if let Some(root) = cloud_folder_root("/home/me/Dropbox/todo.tsk".as_ref()) {
///     println!("synced by a cloud client rooted at {}", root.display());
/// }
/// ```
pub fn cloud_folder_root(path: &Path) -> Option<PathBuf> {
    let start = if path.is_dir() { path } else { path.parent()? };
    let start = if start.as_os_str().is_empty() {
        Path::new(".")
    } else {
        start
    };
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());

    start
        .ancestors()
        .find(|dir| CLOUD_MARKERS.iter().any(|m| dir.join(m).exists()))
        .map(Path::to_path_buf)
}

/// Whether `path` lives inside a sync-client folder.
pub fn is_cloud_folder(path: &Path) -> bool {
    cloud_folder_root(path).is_some()
}

/// A single entry from the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Parse `/proc/mounts` formatted text.
///
/// Octal escapes (`\040` for spaces) in mount points are decoded.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(decode_mount_escapes(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn decode_mount_escapes(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(code) = u8::try_from(code) {
                    out.push(code);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Filesystem type of the mount holding `path`, taken from the longest
/// matching mount point in `table`.
pub fn fs_type_for(path: &Path, table: &[MountEntry]) -> Option<String> {
    table
        .iter()
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.as_os_str().len())
        .map(|entry| entry.fs_type.clone())
}

/// Whether `path` lives on a FUSE filesystem (sshfs, rclone, ...).
///
/// Always `false` where no mount table is available.
pub fn is_fuse_mount(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let absolute = path
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf());
    fs_type_for(&absolute, &parse_mount_table(&contents))
        .is_some_and(|fs_type| fs_type.starts_with("fuse."))
}

/// Check whether a process with the given PID is alive.
///
/// Signal 0 probes for existence without delivering anything; `EPERM` means
/// the process exists but belongs to another user.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    // Without a portable probe, assume the holder is alive
    true
}

/// Hostname of this machine, or `"localhost"` if it cannot be determined.
#[cfg(unix)]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
