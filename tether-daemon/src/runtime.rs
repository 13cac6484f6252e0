//! Daemon runtime: engine loop + socket server + signal handling.
//!
//! A single engine task owns all mutable state (profile store, storage
//! booker, scheduler, sessions) and consumes the engine event channel;
//! socket clients and plugin runners only ever post events. Tasks are
//! joined through a broadcast shutdown channel.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use tether_core::profile::KEY_PLUGIN_PATH;
use tether_core::{Paths, ProfileStore, ProfileType, SyncProfile};

use crate::booker::StorageBooker;
use crate::error::{io_err, DaemonError};
use crate::events::{EngineCommand, EngineEvent};
use crate::paths::{self, socket_path};
use crate::plugin::PluginRegistry;
use crate::protocol::{DaemonRequest, DaemonResponse, WatchEvent};
use crate::runner::{ProcessPluginRunner, ThreadPluginRunner};
use crate::scheduler::{RunnerFactory, Scheduler};
use crate::transport::TransportTracker;

/// How long the engine sleeps when no alarm or trigger is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Runtime configuration, dependency-injected into [`run`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub paths: Paths,
    /// Quiet period before profile-change triggers fire.
    pub quiet_period: chrono::Duration,
    /// Worker executable for out-of-process plugins; resolved from `PATH`
    /// when unset.
    pub worker_bin: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            quiet_period: chrono::Duration::seconds(30),
            worker_bin: None,
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the daemon runtime.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    paths::ensure_daemon_dirs(&config.paths)?;
    let socket = socket_path(&config.paths);
    let started_at_unix = unix_seconds_now();

    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (watch_tx, _) = broadcast::channel::<WatchEvent>(256);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let store = ProfileStore::new(config.paths.clone());
    let transports = TransportTracker::new();
    let registry = Arc::new(PluginRegistry::with_builtins());
    let factory = default_runner_factory(&config, registry);
    let scheduler = Scheduler::new(
        store,
        StorageBooker::new(),
        transports,
        factory,
        event_tx.clone(),
        watch_tx.clone(),
        config.quiet_period,
    );

    let engine_handle = {
        let shutdown = shutdown_tx.clone();
        let socket_display = socket.display().to_string();
        tokio::spawn(async move {
            let result =
                engine_task(scheduler, event_rx, shutdown.subscribe(), started_at_unix, socket_display)
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let socket = socket.clone();
        let event_tx = event_tx.clone();
        let watch_tx = watch_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                socket,
                event_tx,
                watch_tx,
                shutdown.clone(),
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (engine_result, socket_result, signal_result) =
        tokio::join!(engine_handle, socket_handle, signal_handle);

    handle_join("engine", engine_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

async fn engine_task(
    mut scheduler: Scheduler,
    mut event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
    socket_display: String,
) -> Result<(), DaemonError> {
    scheduler.bootstrap(Utc::now());

    loop {
        let sleep_for = scheduler
            .next_wakeup()
            .map(|at| {
                let millis = (at - Utc::now()).num_milliseconds().max(0);
                Duration::from_millis(millis as u64)
            })
            .unwrap_or(IDLE_TICK);

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(sleep_for) => {
                scheduler.handle_deadlines(Utc::now());
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                handle_engine_event(&mut scheduler, event, started_at_unix, &socket_display);
            }
        }
    }

    Ok(())
}

fn handle_engine_event(
    scheduler: &mut Scheduler,
    event: EngineEvent,
    started_at_unix: u64,
    socket_display: &str,
) {
    let now = Utc::now();
    match event {
        EngineEvent::Runner { profile, event } => {
            scheduler.handle_runner_event(&profile, event, now);
        }
        EngineEvent::Command(command) => match command {
            EngineCommand::Status { reply } => {
                let payload = json!({
                    "running": true,
                    "started_at_unix": started_at_unix,
                    "socket": socket_display,
                    "sync": scheduler.snapshot(),
                });
                let _ = reply.send(payload);
            }
            EngineCommand::ListProfiles { profile_type, reply } => {
                let _ = reply.send(scheduler.store().list(profile_type));
            }
            EngineCommand::GetProfile { name, reply } => {
                let doc = scheduler
                    .store()
                    .load(&name, ProfileType::Sync)
                    .and_then(|p| tether_core::xml::write_profile(&p).ok());
                let _ = reply.send(doc);
            }
            EngineCommand::GetLog { name, reply } => {
                let doc = scheduler
                    .store()
                    .load_log(&name)
                    .and_then(|log| tether_core::xml::write_log(&log).ok());
                let _ = reply.send(doc);
            }
            EngineCommand::UpdateProfile { xml, reply } => {
                let _ = reply.send(scheduler.update_profile_xml(&xml, now));
            }
            EngineCommand::RemoveProfile { name, reply } => {
                let _ = reply.send(scheduler.remove_profile(&name, now));
            }
            EngineCommand::StartSync { profile, reply } => {
                let _ = reply.send(scheduler.start_sync(&profile, false, now));
            }
            EngineCommand::AbortSync { profile, reply } => {
                let _ = reply.send(scheduler.abort_sync(&profile, now));
            }
            EngineCommand::Transport { event } => {
                scheduler.handle_transport_event(event, now);
            }
        },
    }
}

/// Default plugin resolution: a `pluginpath` key on the client sub-profile
/// selects the out-of-process worker; otherwise the registry provides an
/// in-process plugin.
fn default_runner_factory(config: &DaemonConfig, registry: Arc<PluginRegistry>) -> RunnerFactory {
    let worker_bin = config
        .worker_bin
        .clone()
        .unwrap_or_else(|| PathBuf::from("tether-worker"));

    Box::new(move |profile: &SyncProfile, events| {
        let client = profile.client_profile()?;
        if let Some(plugin_path) = client.key(KEY_PLUGIN_PATH) {
            return Some(Box::new(ProcessPluginRunner::new(
                client.name.clone(),
                profile.name().to_owned(),
                worker_bin.clone(),
                PathBuf::from(plugin_path),
                events,
            )));
        }
        match registry.create(&client.name) {
            Some(plugin) => Some(Box::new(ThreadPluginRunner::new(
                profile.clone(),
                plugin,
                events,
            ))),
            None => {
                tracing::warn!(plugin = %client.name, "no registered plugin for client profile");
                None
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    socket: PathBuf,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    watch_tx: broadcast::Sender<WatchEvent>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    paths::set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let event_tx = event_tx.clone();
                let watch_tx = watch_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, event_tx, watch_tx, shutdown_tx).await
                    {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    watch_tx: broadcast::Sender<WatchEvent>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        if cmd == "watch" {
            // The connection turns into an event stream.
            return stream_watch_events(writer, watch_tx.subscribe()).await;
        }

        let response = dispatch_request(request, &event_tx, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn dispatch_request(
    request: DaemonRequest,
    event_tx: &mpsc::UnboundedSender<EngineEvent>,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => {
            match engine_call(event_tx, |reply| EngineCommand::Status { reply }).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(response) => response,
            }
        }
        "list-profiles" => {
            let raw_type = request.profile_type.as_deref().unwrap_or("sync");
            let profile_type: ProfileType = match raw_type.parse() {
                Ok(profile_type) => profile_type,
                Err(err) => return DaemonResponse::error(err),
            };
            match engine_call(event_tx, |reply| EngineCommand::ListProfiles {
                profile_type,
                reply,
            })
            .await
            {
                Ok(names) => DaemonResponse::ok(json!({ "profiles": names })),
                Err(response) => response,
            }
        }
        "get-profile" => {
            let Some(name) = request.profile else {
                return DaemonResponse::error("'profile' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::GetProfile { name, reply }).await {
                Ok(Some(xml)) => DaemonResponse::ok(json!({ "xml": xml })),
                Ok(None) => DaemonResponse::error("profile not found"),
                Err(response) => response,
            }
        }
        "get-log" => {
            let Some(name) = request.profile else {
                return DaemonResponse::error("'profile' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::GetLog { name, reply }).await {
                Ok(Some(xml)) => DaemonResponse::ok(json!({ "xml": xml })),
                Ok(None) => DaemonResponse::error("log not found"),
                Err(response) => response,
            }
        }
        "update-profile" => {
            let Some(xml) = request.xml else {
                return DaemonResponse::error("'xml' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::UpdateProfile { xml, reply }).await
            {
                Ok(Ok(name)) => DaemonResponse::ok(json!({ "profile": name })),
                Ok(Err(err)) => DaemonResponse::error(err),
                Err(response) => response,
            }
        }
        "remove-profile" => {
            let Some(name) = request.profile else {
                return DaemonResponse::error("'profile' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::RemoveProfile { name, reply }).await
            {
                Ok(Ok(())) => DaemonResponse::ok(json!({ "removed": true })),
                Ok(Err(err)) => DaemonResponse::error(err),
                Err(response) => response,
            }
        }
        "start-sync" => {
            let Some(profile) = request.profile else {
                return DaemonResponse::error("'profile' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::StartSync { profile, reply }).await
            {
                Ok(accepted) => DaemonResponse::ok(json!({ "accepted": accepted })),
                Err(response) => response,
            }
        }
        "abort-sync" => {
            let Some(profile) = request.profile else {
                return DaemonResponse::error("'profile' is required");
            };
            match engine_call(event_tx, |reply| EngineCommand::AbortSync { profile, reply }).await
            {
                Ok(found) => DaemonResponse::ok(json!({ "aborted": found })),
                Err(response) => response,
            }
        }
        "transport" => {
            let Some(event) = request.transport else {
                return DaemonResponse::error("'transport' is required");
            };
            if event_tx
                .send(EngineEvent::Command(EngineCommand::Transport { event }))
                .is_err()
            {
                return DaemonResponse::error("engine unavailable");
            }
            DaemonResponse::ok(json!({ "applied": true }))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn engine_call<T>(
    event_tx: &mpsc::UnboundedSender<EngineEvent>,
    make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
) -> Result<T, DaemonResponse> {
    let (tx, rx) = oneshot::channel();
    if event_tx.send(EngineEvent::Command(make(tx))).is_err() {
        return Err(DaemonResponse::error("engine unavailable"));
    }
    rx.await
        .map_err(|_| DaemonResponse::error("engine dropped the request"))
}

async fn stream_watch_events(
    mut writer: OwnedWriteHalf,
    mut watch_rx: broadcast::Receiver<WatchEvent>,
) -> Result<(), DaemonError> {
    loop {
        match watch_rx.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event)?;
                if writer.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "watch client lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
