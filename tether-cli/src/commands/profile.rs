//! `tether profile` — profile management over the daemon socket.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use tether_core::Paths;
use tether_daemon::protocol;

use super::{not_running_hint, socket};

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    /// List profile names known to the daemon.
    List {
        /// Profile type to list.
        #[arg(long, default_value = "sync")]
        profile_type: String,
    },
    /// Print a profile document.
    Show { name: String },
    /// Print a profile's sync log.
    Log { name: String },
    /// Create or overwrite a profile from an XML file.
    Update { file: PathBuf },
    /// Remove a profile (refused for protected profiles).
    Remove { name: String },
}

pub fn run(command: ProfileCommand, paths: &Paths) -> Result<()> {
    let socket = socket(paths);
    match command {
        ProfileCommand::List { profile_type } => {
            let data = protocol::request_list_profiles(&socket, Some(&profile_type))
                .map_err(not_running_hint)?;
            if let Some(names) = data["profiles"].as_array() {
                for name in names {
                    if let Some(name) = name.as_str() {
                        println!("{name}");
                    }
                }
            }
        }
        ProfileCommand::Show { name } => {
            let data = protocol::request_get_profile(&socket, &name).map_err(not_running_hint)?;
            print_xml(&data);
        }
        ProfileCommand::Log { name } => {
            let data = protocol::request_get_log(&socket, &name).map_err(not_running_hint)?;
            print_xml(&data);
        }
        ProfileCommand::Update { file } => {
            let document = fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let data =
                protocol::request_update_profile(&socket, &document).map_err(not_running_hint)?;
            if let Some(name) = data["profile"].as_str() {
                println!("profile '{name}' updated");
            }
        }
        ProfileCommand::Remove { name } => {
            protocol::request_remove_profile(&socket, &name).map_err(not_running_hint)?;
            println!("profile '{name}' removed");
        }
    }
    Ok(())
}

fn print_xml(data: &serde_json::Value) {
    if let Some(xml) = data["xml"].as_str() {
        println!("{xml}");
    }
}
