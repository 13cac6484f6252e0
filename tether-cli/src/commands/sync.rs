//! `tether sync` / `tether abort` / `tether watch`.

use anyhow::Result;
use clap::Args;

use tether_core::Paths;
use tether_daemon::protocol;

use super::{not_running_hint, socket};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Profile to sync.
    pub profile: String,
}

impl SyncArgs {
    pub fn run(&self, paths: &Paths) -> Result<()> {
        let data = protocol::request_start_sync(&socket(paths), &self.profile)
            .map_err(not_running_hint)?;
        if data["accepted"].as_bool().unwrap_or(false) {
            println!("sync requested for '{}'", self.profile);
        } else {
            println!("sync refused for '{}'; see the profile log", self.profile);
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct AbortArgs {
    /// Profile whose sync should be aborted.
    pub profile: String,
}

impl AbortArgs {
    pub fn run(&self, paths: &Paths) -> Result<()> {
        let data = protocol::request_abort_sync(&socket(paths), &self.profile)
            .map_err(not_running_hint)?;
        if data["aborted"].as_bool().unwrap_or(false) {
            println!("abort requested for '{}'", self.profile);
        } else {
            println!("no running sync for '{}'", self.profile);
        }
        Ok(())
    }
}

/// Stream sync events until the daemon goes away or the pipe closes.
pub fn watch(paths: &Paths) -> Result<()> {
    protocol::watch_events(&socket(paths), |event| {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(_) => return false,
        }
        true
    })
    .map_err(not_running_hint)?;
    Ok(())
}
