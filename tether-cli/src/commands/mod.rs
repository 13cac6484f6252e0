pub mod daemon;
pub mod profile;
pub mod status;
pub mod sync;
pub mod transport;

use std::path::PathBuf;

use tether_core::Paths;
use tether_daemon::paths::socket_path;

pub(crate) fn socket(paths: &Paths) -> PathBuf {
    socket_path(paths)
}

/// Uniform handling for commands that need a live daemon.
pub(crate) fn not_running_hint(err: tether_daemon::DaemonError) -> anyhow::Error {
    match err {
        tether_daemon::DaemonError::DaemonNotRunning { socket } => anyhow::anyhow!(
            "daemon is not running (socket missing: {}); start it with 'tether daemon start'",
            socket.display()
        ),
        other => other.into(),
    }
}
