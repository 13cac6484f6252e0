//! tether-worker — out-of-process plugin host.
//!
//! Spawned by the daemon with three positional arguments (plugin name,
//! profile name, plugin library path). Registers its derived service name
//! on stdout, then serves commands from stdin until `stop` or EOF.
//!
//! Exit codes: `0` normal, `-1` failed to register the protocol object
//! (stdout unusable), `-2` failed to register the service (unknown plugin).

use std::io::{self, BufRead, IsTerminal, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use clap::Parser;

use tether_core::profile::{Profile, ProfileType};
use tether_core::{MajorCode, Paths, ProfileStore, SyncLog, SyncProfile, SyncResults};
use tether_daemon::{
    derived_service_name, PluginRegistry, ProgressSink, RunnerEvent, SessionContext,
    WorkerCommand, WorkerReply,
};

const EXIT_OBJECT_FAILED: i32 = -1;
const EXIT_SERVICE_FAILED: i32 = -2;

/// Override for the primary profile root, used by tests.
const PROFILES_DIR_ENV: &str = "TETHER_PRIMARY_DIR";

#[derive(Parser, Debug)]
#[command(
    name = "tether-worker",
    version,
    about = "Host one sync plugin on behalf of the tether daemon"
)]
struct Args {
    /// Name of the plugin to host.
    plugin_name: String,
    /// Profile the plugin syncs.
    profile_name: String,
    /// Path to the plugin library.
    plugin_path: PathBuf,
}

fn main() {
    init_tracing();
    let args = Args::parse();
    process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let service = derived_service_name(&args.profile_name);
    tracing::debug!(service = %service, "registering worker service");

    // Claiming stdout is our protocol object; losing it is fatal.
    if write_reply(&WorkerReply::Register { service }).is_err() {
        tracing::error!("failed to register protocol object on stdout");
        return EXIT_OBJECT_FAILED;
    }

    let registry = PluginRegistry::with_builtins();
    let Some(mut plugin) = registry.create(&args.plugin_name) else {
        tracing::error!(
            plugin = %args.plugin_name,
            path = %args.plugin_path.display(),
            "unknown plugin, cannot provide service",
        );
        return EXIT_SERVICE_FAILED;
    };

    let abort = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let (start_tx, start_rx) = mpsc::channel::<()>();
    {
        let abort = abort.clone();
        let stop = stop.clone();
        thread::spawn(move || read_commands(&abort, &stop, &start_tx));
    }

    // Wait for the daemon's start command; EOF means it went away.
    if start_rx.recv().is_err() {
        tracing::debug!("daemon closed the channel before start");
        return 0;
    }

    let profile = load_profile(&args.profile_name);
    let ctx = SessionContext::new(profile, abort, stop, Arc::new(StdoutSink));

    let outcome = catch_unwind(AssertUnwindSafe(|| plugin.sync(&ctx)));
    match outcome {
        Ok(Ok(results)) => {
            // Results go out before the terminal event so the daemon's
            // snapshot is complete when the session finishes.
            let _ = write_reply(&WorkerReply::Results { results });
            let _ = write_reply(&WorkerReply::Event {
                event: RunnerEvent::Success {
                    message: String::new(),
                },
            });
        }
        Ok(Err(failure)) => {
            let mut results =
                SyncResults::new(chrono::Utc::now(), MajorCode::Failed, failure.minor);
            results.end_time = chrono::Utc::now();
            let _ = write_reply(&WorkerReply::Results { results });
            let _ = write_reply(&WorkerReply::Event {
                event: RunnerEvent::Error {
                    message: failure.message,
                    minor: failure.minor,
                },
            });
        }
        Err(_) => {
            // No terminal event: the daemon reports unexpected termination.
            tracing::error!(plugin = %args.plugin_name, "plugin panicked");
        }
    }
    let _ = write_reply(&WorkerReply::Event {
        event: RunnerEvent::Done,
    });

    0
}

fn read_commands(abort: &AtomicBool, stop: &AtomicBool, start_tx: &mpsc::Sender<()>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerCommand>(&line) {
            Ok(WorkerCommand::Start) => {
                let _ = start_tx.send(());
            }
            Ok(WorkerCommand::Abort { status }) => {
                tracing::debug!(%status, "abort requested");
                abort.store(true, Ordering::SeqCst);
            }
            Ok(WorkerCommand::Stop) => {
                stop.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                tracing::warn!(error = %err, "unparseable worker command");
            }
        }
    }
    // Daemon side of the pipe is gone; wind the plugin down.
    stop.store(true, Ordering::SeqCst);
}

/// Load the expanded profile from the store, falling back to a bare one so
/// the plugin still gets its profile name.
fn load_profile(name: &str) -> SyncProfile {
    let mut paths = Paths::system_default();
    if let Ok(dir) = std::env::var(PROFILES_DIR_ENV) {
        paths.primary = PathBuf::from(dir);
    }
    let store = ProfileStore::new(paths);
    if let Some(profile) = store.sync_profile(name) {
        return profile;
    }
    tracing::debug!(profile = name, "profile not found on disk, using bare profile");
    let bare = Profile::new(name, ProfileType::Sync);
    match SyncProfile::new(bare, SyncLog::new(name)) {
        Some(profile) => profile,
        // A bare profile of type sync is always accepted.
        None => process::exit(EXIT_OBJECT_FAILED),
    }
}

struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn emit(&self, event: RunnerEvent) {
        let _ = write_reply(&WorkerReply::Event { event });
    }
}

fn write_reply(reply: &WorkerReply) -> io::Result<()> {
    let line = serde_json::to_string(reply).map_err(io::Error::other)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // stdout carries the protocol; logs must go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .try_init();
}
