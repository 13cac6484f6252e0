//! tether — sync daemon control CLI.
//!
//! # Usage
//!
//! ```text
//! tether profile list [--profile-type sync|service|storage|client|server]
//! tether profile show <name>
//! tether profile log <name>
//! tether profile update <file.xml>
//! tether profile remove <name>
//! tether sync <profile>
//! tether abort <profile>
//! tether status
//! tether watch
//! tether transport usb|internet|bt-added|bt-removed|bt-powered ...
//! tether daemon start|stop|status
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tether_core::Paths;

use commands::{
    daemon::DaemonCommand,
    profile::ProfileCommand,
    sync::{AbortArgs, SyncArgs},
    transport::TransportCommand,
};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Control the tether synchronization daemon",
    long_about = None,
)]
struct Cli {
    /// User-writable profile root (defaults to the system data location).
    #[arg(long, global = true)]
    primary: Option<PathBuf>,

    /// Read-only system profile root.
    #[arg(long, global = true)]
    secondary: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and edit sync profiles through the daemon.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },

    /// Start a sync for a profile.
    Sync(SyncArgs),

    /// Abort a running or queued sync.
    Abort(AbortArgs),

    /// Show daemon and scheduler status.
    Status,

    /// Stream sync progress and terminal events.
    Watch,

    /// Report a connectivity change on behalf of a transport driver.
    Transport {
        #[command(subcommand)]
        command: TransportCommand,
    },

    /// Run or control the daemon process.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

impl Cli {
    fn paths(&self) -> Paths {
        let mut paths = Paths::system_default();
        if let Some(primary) = &self.primary {
            paths.primary = primary.clone();
        }
        if let Some(secondary) = &self.secondary {
            paths.secondary = secondary.clone();
        }
        paths
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = cli.paths();
    match cli.command {
        Commands::Profile { command } => commands::profile::run(command, &paths),
        Commands::Sync(args) => args.run(&paths),
        Commands::Abort(args) => args.run(&paths),
        Commands::Status => commands::status::run(&paths),
        Commands::Watch => commands::sync::watch(&paths),
        Commands::Transport { command } => commands::transport::run(command, &paths),
        Commands::Daemon { command } => commands::daemon::run(command, &paths),
    }
}
