//! CLI argument definitions for tsk.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{ConfigOverrides, WatchMode};
use crate::storage::atomic::WriteDurability;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TSK_GIT_COMMIT"),
    ", built ",
    env!("TSK_BUILD_TIMESTAMP"),
    ")"
);

/// tsk - inspect, upgrade and merge `.tsk` task files.
///
/// Output is JSON unless -H is given.
#[derive(Parser, Debug)]
#[command(name = "tsk")]
#[command(author, version, long_version = LONG_VERSION)]
#[command(about = "Inspect, upgrade and merge .tsk task files", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Write log lines to stderr as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// How long to wait for another process's lock, in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    pub lock_timeout_ms: Option<u64>,

    /// Write durability: "durable" or "best-effort"
    #[arg(long, global = true, value_parser = parse_durability)]
    pub durability: Option<WriteDurability>,

    /// Do not back up the previous version before saving
    #[arg(long, global = true)]
    pub no_backups: bool,

    /// File watcher: "native", "poll" or "off"
    #[arg(long, global = true, value_parser = parse_watch_mode)]
    pub watch_mode: Option<WatchMode>,

    #[command(subcommand)]
    pub command: Commands,
}

fn parse_durability(s: &str) -> Result<WriteDurability, String> {
    WriteDurability::parse(s).ok_or_else(|| format!("expected durable or best-effort, got {:?}", s))
}

fn parse_watch_mode(s: &str) -> Result<WatchMode, String> {
    WatchMode::parse(s).ok_or_else(|| format!("expected native, poll or off, got {:?}", s))
}

impl Cli {
    /// Settings given on the command line, highest in precedence.
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ms) = self.lock_timeout_ms {
            overrides = overrides.with_lock_timeout_ms(ms);
        }
        if let Some(durability) = self.durability {
            overrides = overrides.with_durability(durability);
        }
        if self.no_backups {
            overrides = overrides.with_backups(false);
        }
        if let Some(mode) = self.watch_mode {
            overrides = overrides.with_watch_mode(mode);
        }
        overrides
    }
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summarize a task file: format version, object counts, devices
    Info {
        /// Task file
        file: PathBuf,
    },

    /// Read a task file and report malformed fields and dangling references
    ///
    /// Exits non-zero only when the file cannot be read at all.
    Check {
        /// Task file
        file: PathBuf,
    },

    /// Rewrite a task file in the current format version
    Upgrade {
        /// Task file
        file: PathBuf,
    },

    /// Copy every object of another task file into a task file
    ///
    /// Objects whose id already exists replace the local ones.
    Import {
        /// Task file to merge into
        file: PathBuf,
        /// Task file to read objects from
        other: PathBuf,
    },

    /// Show the pending change ledgers stored next to a task file
    Changes {
        /// Task file
        file: PathBuf,
    },

    /// Lock management commands
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Backup management commands
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Report changes to a task file until interrupted with Ctrl-C
    Watch {
        /// Task file
        file: PathBuf,

        /// Merge each change into memory and report what it contained
        #[arg(long)]
        merge: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Lock subcommands
#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Show whether a task file is locked and by whom
    Status {
        /// Task file
        file: PathBuf,
    },

    /// Remove a lock left behind by a crashed process
    Break {
        /// Task file
        file: PathBuf,

        /// Remove the lock even if its holder is still running
        #[arg(long)]
        force: bool,
    },
}

/// Backup subcommands
#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// List backups of a task file, newest first
    List {
        /// Task file
        file: PathBuf,
    },

    /// Restore a backup
    Restore {
        /// Task file the backup was taken of
        file: PathBuf,

        /// Backup id as shown by `tsk backups list` (YYYYMMDDHHMMSS)
        id: String,

        /// Where to write the restored file (default: over the task file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration and where each value came from
    Show {
        /// Include the document-local config next to this task file
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // This will panic if the CLI is misconfigured
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "tsk",
            "info",
            "work.tsk",
            "--lock-timeout-ms",
            "250",
            "--durability",
            "best-effort",
            "--no-backups",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.config.lock_timeout_ms, Some(250));
        assert_eq!(overrides.config.durability, Some(WriteDurability::BestEffort));
        assert_eq!(overrides.config.backups, Some(false));
        assert_eq!(overrides.config.watch_mode, None);
    }

    #[test]
    fn test_rejects_unknown_watch_mode() {
        assert!(Cli::try_parse_from(["tsk", "watch", "a.tsk", "--watch-mode", "inotify"]).is_err());
    }

    #[test]
    fn test_lock_break_force() {
        let cli = Cli::try_parse_from(["tsk", "lock", "break", "a.tsk", "--force"]).unwrap();
        match cli.command {
            Commands::Lock {
                command: LockCommands::Break { file, force },
            } => {
                assert_eq!(file, PathBuf::from("a.tsk"));
                assert!(force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
