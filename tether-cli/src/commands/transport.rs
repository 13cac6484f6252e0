//! `tether transport` — feed connectivity observations to the daemon.
//!
//! The daemon does not read platform connectivity itself; external driver
//! shims (USB moded, BlueZ, the network stack) report state changes through
//! this command's event contract.

use anyhow::Result;
use clap::Subcommand;

use tether_core::Paths;
use tether_daemon::{protocol, TransportEvent};

use super::{not_running_hint, socket};

#[derive(Subcommand, Debug)]
pub enum TransportCommand {
    /// USB tether connection state.
    Usb {
        #[arg(action = clap::ArgAction::Set)]
        connected: bool,
    },
    /// Internet reachability, with an optional medium tag (wifi, cellular, ...).
    Internet {
        #[arg(action = clap::ArgAction::Set)]
        online: bool,
        #[arg(long)]
        medium: Option<String>,
    },
    /// A Bluetooth adapter appeared at the given object path.
    BtAdded {
        path: String,
        #[arg(action = clap::ArgAction::Set)]
        powered: bool,
    },
    /// The Bluetooth adapter at the given object path vanished.
    BtRemoved { path: String },
    /// The Powered property changed on an adapter.
    BtPowered {
        path: String,
        #[arg(action = clap::ArgAction::Set)]
        powered: bool,
    },
}

impl TransportCommand {
    fn into_event(self) -> TransportEvent {
        match self {
            TransportCommand::Usb { connected } => TransportEvent::Usb { connected },
            TransportCommand::Internet { online, medium } => {
                TransportEvent::Internet { online, medium }
            }
            TransportCommand::BtAdded { path, powered } => {
                TransportEvent::BtAdapterAdded { path, powered }
            }
            TransportCommand::BtRemoved { path } => TransportEvent::BtAdapterRemoved { path },
            TransportCommand::BtPowered { path, powered } => {
                TransportEvent::BtPoweredChanged { path, powered }
            }
        }
    }
}

pub fn run(command: TransportCommand, paths: &Paths) -> Result<()> {
    protocol::send_transport_event(&socket(paths), command.into_event())
        .map_err(not_running_hint)?;
    println!("transport event applied");
    Ok(())
}
