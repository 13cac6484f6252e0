//! JSON newline-delimited socket protocol and blocking client helpers.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{MinorCode, SyncStatus};

use crate::error::{io_err, DaemonError};
use crate::runner::{TransferDb, TransferDirection};
use crate::transport::TransportEvent;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportEvent>,
}

impl DaemonRequest {
    pub fn bare(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            profile: None,
            profile_type: None,
            xml: None,
            transport: None,
        }
    }

    pub fn for_profile(cmd: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            profile: Some(profile.into()),
            ..Self::bare(cmd)
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Progress and terminal signals streamed to `watch` clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchEvent {
    Status {
        profile: String,
        status: SyncStatus,
        message: String,
        minor: MinorCode,
    },
    TransferProgress {
        profile: String,
        db: TransferDb,
        direction: TransferDirection,
        mime: String,
        committed: u64,
    },
    StorageAcquired {
        profile: String,
        mime: String,
    },
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Query daemon status, retrying briefly while the daemon comes up.
pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::bare("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(socket, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::bare("stop"))?;
    response_into_data(response).map(|_| ())
}

pub fn request_start_sync(socket: &Path, profile: &str) -> Result<Value, DaemonError> {
    let response = send_request(socket, &DaemonRequest::for_profile("start-sync", profile))?;
    response_into_data(response)
}

pub fn request_abort_sync(socket: &Path, profile: &str) -> Result<Value, DaemonError> {
    let response = send_request(socket, &DaemonRequest::for_profile("abort-sync", profile))?;
    response_into_data(response)
}

pub fn request_list_profiles(
    socket: &Path,
    profile_type: Option<&str>,
) -> Result<Value, DaemonError> {
    let mut request = DaemonRequest::bare("list-profiles");
    request.profile_type = profile_type.map(str::to_owned);
    let response = send_request(socket, &request)?;
    response_into_data(response)
}

pub fn request_get_profile(socket: &Path, profile: &str) -> Result<Value, DaemonError> {
    let response = send_request(socket, &DaemonRequest::for_profile("get-profile", profile))?;
    response_into_data(response)
}

pub fn request_get_log(socket: &Path, profile: &str) -> Result<Value, DaemonError> {
    let response = send_request(socket, &DaemonRequest::for_profile("get-log", profile))?;
    response_into_data(response)
}

pub fn request_update_profile(socket: &Path, xml: &str) -> Result<Value, DaemonError> {
    let mut request = DaemonRequest::bare("update-profile");
    request.xml = Some(xml.to_owned());
    let response = send_request(socket, &request)?;
    response_into_data(response)
}

pub fn request_remove_profile(socket: &Path, profile: &str) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::for_profile("remove-profile", profile))?;
    response_into_data(response).map(|_| ())
}

/// Feed one transport driver event to the daemon.
pub fn send_transport_event(socket: &Path, event: TransportEvent) -> Result<(), DaemonError> {
    let mut request = DaemonRequest::bare("transport");
    request.transport = Some(event);
    let response = send_request(socket, &request)?;
    response_into_data(response).map(|_| ())
}

/// Stream sync events until the daemon goes away or `on_event` returns
/// `false`.
pub fn watch_events(
    socket: &Path,
    mut on_event: impl FnMut(WatchEvent) -> bool,
) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }
    let mut stream = UnixStream::connect(socket).map_err(|e| io_err(socket, e))?;
    let payload = serde_json::to_string(&DaemonRequest::bare("watch"))?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.map_err(|e| io_err(socket, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WatchEvent>(&line) {
            Ok(event) => {
                if !on_event(event) {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "unparseable watch event");
            }
        }
    }
    Ok(())
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
