//! `tether status` — daemon status as pretty JSON.

use anyhow::{Context, Result};

use tether_core::Paths;
use tether_daemon::protocol;
use tether_daemon::DaemonError;

use super::socket;

pub fn run(paths: &Paths) -> Result<()> {
    let socket = socket(paths);
    match protocol::request_status(&socket) {
        Ok(status) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("render daemon status JSON")?
            );
        }
        Err(DaemonError::DaemonNotRunning { .. }) => {
            let payload = serde_json::json!({
                "running": false,
                "socket": socket.display().to_string(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("render daemon status JSON")?
            );
        }
        Err(err) => return Err(err).context("failed to query daemon status"),
    }
    Ok(())
}
