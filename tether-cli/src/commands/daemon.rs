//! `tether daemon` — daemon lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use tether_core::Paths;
use tether_daemon::{protocol, DaemonConfig, DaemonError};

use super::socket;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (engine + socket server).
    Start,
    /// Request graceful daemon shutdown over the socket.
    Stop,
    /// Query daemon runtime status over the socket.
    Status,
}

pub fn run(command: DaemonCommand, paths: &Paths) -> Result<()> {
    match command {
        DaemonCommand::Start => {
            let config = DaemonConfig::new(paths.clone());
            tether_daemon::start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match protocol::request_stop(&socket(paths)) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => super::status::run(paths)?,
    }
    Ok(())
}
