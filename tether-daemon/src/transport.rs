//! Connectivity tracking.
//!
//! The tracker keeps a mutex-guarded `{Transport → bool}` snapshot fed by
//! driver events; the drivers themselves (USB moded, BlueZ, the network
//! stack) are external collaborators that deliver [`TransportEvent`]s over
//! the daemon protocol. Readers on any thread see the current snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use tether_core::Transport;

/// A connectivity observation from a platform driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportEvent {
    Usb {
        connected: bool,
    },
    BtAdapterAdded {
        path: String,
        powered: bool,
    },
    BtAdapterRemoved {
        path: String,
    },
    BtPoweredChanged {
        path: String,
        powered: bool,
    },
    Internet {
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        medium: Option<String>,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    states: HashMap<Transport, bool>,
    /// Object path of the tracked ("default") Bluetooth adapter.
    default_bt_adapter: Option<String>,
    internet_medium: Option<String>,
}

/// Shared connectivity snapshot. Cheap to clone; all clones observe the
/// same state.
#[derive(Debug, Clone, Default)]
pub struct TransportTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl TransportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current availability of a connectivity kind.
    pub fn is_available(&self, kind: Transport) -> bool {
        *self.lock().states.get(&kind).unwrap_or(&false)
    }

    /// Full availability snapshot, absent kinds reported as down.
    pub fn snapshot(&self) -> HashMap<Transport, bool> {
        let state = self.lock();
        [Transport::Usb, Transport::Bt, Transport::Internet]
            .into_iter()
            .map(|kind| (kind, *state.states.get(&kind).unwrap_or(&false)))
            .collect()
    }

    pub fn internet_medium(&self) -> Option<String> {
        self.lock().internet_medium.clone()
    }

    /// Apply a driver event.
    ///
    /// Returns the changed `(kind, value)` entry, or `None` when the event
    /// did not change anything (duplicate observations never re-emit).
    pub fn apply(&self, event: TransportEvent) -> Option<(Transport, bool)> {
        let mut state = self.lock();
        match event {
            TransportEvent::Usb { connected } => update(&mut state, Transport::Usb, connected),
            TransportEvent::BtAdapterAdded { path, powered } => {
                match &state.default_bt_adapter {
                    // Only the first adapter discovered is tracked.
                    Some(default) if *default != path => {
                        tracing::debug!(path = %path, "ignoring additional bluetooth adapter");
                        None
                    }
                    _ => {
                        state.default_bt_adapter = Some(path);
                        update(&mut state, Transport::Bt, powered)
                    }
                }
            }
            TransportEvent::BtAdapterRemoved { path } => {
                if state.default_bt_adapter.as_deref() != Some(path.as_str()) {
                    return None;
                }
                state.default_bt_adapter = None;
                update(&mut state, Transport::Bt, false)
            }
            TransportEvent::BtPoweredChanged { path, powered } => {
                if state.default_bt_adapter.as_deref() != Some(path.as_str()) {
                    return None;
                }
                update(&mut state, Transport::Bt, powered)
            }
            TransportEvent::Internet { online, medium } => {
                state.internet_medium = if online { medium } else { None };
                update(&mut state, Transport::Internet, online)
            }
        }
    }

    /// Resolve a network-session request against the current snapshot.
    ///
    /// The driver owns real session bring-up; the daemon only answers
    /// whether the internet is currently reachable.
    pub fn request_network_session(&self) -> NetworkSessionOutcome {
        if self.is_available(Transport::Internet) {
            NetworkSessionOutcome::Opened
        } else {
            NetworkSessionOutcome::Error
        }
    }
}

/// Result of asking the transport layer to open a network session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSessionOutcome {
    Opened,
    Error,
}

fn update(state: &mut TrackerState, kind: Transport, value: bool) -> Option<(Transport, bool)> {
    let old = state.states.insert(kind, value);
    if old == Some(value) {
        return None;
    }
    tracing::info!(transport = %kind, available = value, "connectivity changed");
    Some((kind, value))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
