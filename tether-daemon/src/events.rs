//! Events consumed by the engine loop.
//!
//! Everything that mutates engine state — socket commands, plugin runner
//! events, transport observations — is posted here and handled one at a
//! time, so state transitions are atomic with respect to each other.

use serde_json::Value;
use tokio::sync::oneshot;

use tether_core::ProfileType;

use crate::runner::RunnerEvent;
use crate::transport::TransportEvent;

/// A request from a socket client, answered through a oneshot channel.
#[derive(Debug)]
pub enum EngineCommand {
    Status {
        reply: oneshot::Sender<Value>,
    },
    ListProfiles {
        profile_type: ProfileType,
        reply: oneshot::Sender<Vec<String>>,
    },
    GetProfile {
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
    GetLog {
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
    UpdateProfile {
        xml: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    RemoveProfile {
        name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    StartSync {
        profile: String,
        reply: oneshot::Sender<bool>,
    },
    AbortSync {
        profile: String,
        reply: oneshot::Sender<bool>,
    },
    /// A connectivity observation from an external transport driver.
    Transport { event: TransportEvent },
}

/// Anything the engine loop reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Command(EngineCommand),
    /// An event from the plugin runner of the named profile's session.
    Runner {
        profile: String,
        event: RunnerEvent,
    },
}
