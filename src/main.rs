//! tsk CLI - inspect, upgrade and merge `.tsk` task files.

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tskfile::cli::{BackupCommands, Cli, Commands, ConfigCommands, LockCommands};
use tskfile::commands::{self, CommandResult};

/// Environment variable holding the log filter, e.g. `TSK_LOG=tskfile=debug`.
const LOG_ENV: &str = "TSK_LOG";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;
    init_logging(cli.log_json);

    if let Err(e) = run_command(cli, human) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

/// Log to stderr so stdout stays machine-readable.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_command(cli: Cli, human: bool) -> Result<(), tskfile::Error> {
    let overrides = cli.overrides();
    match cli.command {
        Commands::Info { file } => output(&commands::info(&file)?, human),
        Commands::Check { file } => output(&commands::check(&file)?, human),
        Commands::Upgrade { file } => output(&commands::upgrade(&file, &overrides)?, human),
        Commands::Import { file, other } => {
            output(&commands::import(&file, &other, &overrides)?, human)
        }
        Commands::Changes { file } => output(&commands::changes(&file)?, human),
        Commands::Lock { command } => match command {
            LockCommands::Status { file } => output(&commands::lock_status(&file)?, human),
            LockCommands::Break { file, force } => {
                output(&commands::lock_break(&file, force)?, human)
            }
        },
        Commands::Backups { command } => match command {
            BackupCommands::List { file } => {
                output(&commands::backups_list(&file, &overrides)?, human)
            }
            BackupCommands::Restore { file, id, output: out } => output(
                &commands::backups_restore(&file, &id, out.as_deref(), &overrides)?,
                human,
            ),
        },
        Commands::Watch { file, merge } => {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop);
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).map_err(|e| {
                tskfile::Error::Other(format!("Could not install Ctrl-C handler: {}", e))
            })?;
            let summary = commands::watch(&file, merge, &overrides, &stop, |event| {
                output(event, human)
            })?;
            output(&summary, human);
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show { file } => {
                output(&commands::config_show(file.as_deref(), &overrides)?, human)
            }
        },
    }
    Ok(())
}

fn output<T: CommandResult>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
