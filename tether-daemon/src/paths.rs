use std::fs;
use std::path::{Path, PathBuf};

use tether_core::Paths;

use crate::error::{io_err, DaemonError};

pub const DAEMON_SOCKET: &str = "tetherd.sock";

pub fn run_dir(paths: &Paths) -> PathBuf {
    paths.primary.join("run")
}

pub fn socket_path(paths: &Paths) -> PathBuf {
    run_dir(paths).join(DAEMON_SOCKET)
}

/// Create the daemon's cache and runtime directories with owner-only
/// permissions.
///
/// The daemon runs as the invoking user, so ownership is already correct;
/// a dedicated same-named group is optional and its absence is only logged.
pub fn ensure_daemon_dirs(paths: &Paths) -> Result<(), DaemonError> {
    for dir in [paths.primary.clone(), run_dir(paths)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        set_dir_permissions(&dir)?;
    }
    tracing::debug!(
        path = %paths.primary.display(),
        "cache directory ready; running without a dedicated daemon group",
    );
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
