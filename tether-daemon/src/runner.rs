//! Plugin runners.
//!
//! A [`PluginRunner`] is the session's capability over a running plugin:
//! start it, ask it to abort or stop, and read its result snapshot. Two
//! variants exist — [`ThreadPluginRunner`] owns an in-process plugin on a
//! worker thread, [`ProcessPluginRunner`] drives the `tether-worker`
//! executable over newline-delimited JSON on its stdio. Both deliver
//! [`RunnerEvent`]s to the engine loop through the event channel; the core
//! never blocks on plugin I/O.

use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use tether_core::{MajorCode, MinorCode, SyncProfile, SyncResults, SyncStatus};

use crate::events::EngineEvent;
use crate::plugin::{ProgressSink, SessionContext, SyncPlugin};

/// Service name prefix under which out-of-process plugins register.
pub const SERVICE_PREFIX: &str = "tether.plugin.";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which side of the exchange a transfer count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDb {
    Local,
    Remote,
}

/// Direction of a transfer relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Signals emitted by a plugin runner towards its owning session.
///
/// `Error` and `Success` are terminal and arrive at most once; `Done`
/// always follows a terminal event — a `Done` without one means the plugin
/// terminated unexpectedly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    TransferProgress {
        db: TransferDb,
        direction: TransferDirection,
        mime: String,
        committed: u64,
    },
    StorageAcquired {
        mime: String,
    },
    SyncProgressDetail {
        code: i32,
    },
    Error {
        message: String,
        minor: MinorCode,
    },
    Success {
        message: String,
    },
    Done,
    /// The runner object is gone; the session must forget it.
    Destroyed,
}

// ---------------------------------------------------------------------------
// Worker wire protocol
// ---------------------------------------------------------------------------

/// Commands sent to the worker executable on its stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum WorkerCommand {
    Start,
    Abort { status: SyncStatus },
    Stop,
}

/// Replies read from the worker executable's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum WorkerReply {
    /// First reply: the worker announces its derived service name.
    Register { service: String },
    Event { event: RunnerEvent },
    Results { results: SyncResults },
}

/// Service name an out-of-process plugin registers for `profile`.
///
/// Profile names starting with a digit (randomly generated ones are purely
/// numeric) get a `profile-` infix to stay a legal service path segment.
pub fn derived_service_name(profile: &str) -> String {
    if profile.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("{SERVICE_PREFIX}profile-{profile}")
    } else {
        format!("{SERVICE_PREFIX}{profile}")
    }
}

// ---------------------------------------------------------------------------
// PluginRunner capability
// ---------------------------------------------------------------------------

/// Abstract handle over a running plugin instance.
pub trait PluginRunner: Send {
    fn plugin_name(&self) -> &str;

    /// Initialize and begin; returns whether startup succeeded. Events flow
    /// to the engine channel from here on.
    fn start(&mut self) -> bool;

    /// Request immediate termination with a status hint. At most once.
    fn abort(&mut self, status: SyncStatus);

    /// Request graceful termination at the plugin's next checkpoint.
    fn stop(&mut self);

    /// Result snapshot; meaningful at/after completion.
    fn sync_results(&self) -> SyncResults;
}

fn initial_results() -> SyncResults {
    SyncResults::new(chrono::Utc::now(), MajorCode::Failed, MinorCode::NoError)
}

fn store_results(slot: &Mutex<SyncResults>, results: SyncResults) {
    if let Ok(mut guard) = slot.lock() {
        *guard = results;
    }
}

fn read_results(slot: &Mutex<SyncResults>) -> SyncResults {
    slot.lock()
        .map(|guard| guard.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

/// Sink that forwards plugin progress into the engine loop, tagged with the
/// owning profile.
struct EngineSink {
    profile: String,
    events: UnboundedSender<EngineEvent>,
}

impl EngineSink {
    fn send(&self, event: RunnerEvent) {
        let _ = self.events.send(EngineEvent::Runner {
            profile: self.profile.clone(),
            event,
        });
    }
}

impl ProgressSink for EngineSink {
    fn emit(&self, event: RunnerEvent) {
        self.send(event);
    }
}

// ---------------------------------------------------------------------------
// In-process runner
// ---------------------------------------------------------------------------

/// Runs an in-process plugin on a dedicated worker thread that owns it;
/// the session interacts only through flags and the event channel.
pub struct ThreadPluginRunner {
    plugin_name: String,
    profile: SyncProfile,
    events: UnboundedSender<EngineEvent>,
    abort: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    results: Arc<Mutex<SyncResults>>,
    plugin: Option<Box<dyn SyncPlugin>>,
}

impl ThreadPluginRunner {
    pub fn new(
        profile: SyncProfile,
        plugin: Box<dyn SyncPlugin>,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            plugin_name: plugin.name().to_owned(),
            profile,
            events,
            abort: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            results: Arc::new(Mutex::new(initial_results())),
            plugin: Some(plugin),
        }
    }
}

impl PluginRunner for ThreadPluginRunner {
    fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    fn start(&mut self) -> bool {
        let Some(mut plugin) = self.plugin.take() else {
            tracing::warn!(plugin = %self.plugin_name, "plugin runner started twice");
            return false;
        };

        let sink = Arc::new(EngineSink {
            profile: self.profile.name().to_owned(),
            events: self.events.clone(),
        });
        let ctx = SessionContext::new(
            self.profile.clone(),
            self.abort.clone(),
            self.stop.clone(),
            sink.clone(),
        );
        let results = self.results.clone();
        let plugin_name = self.plugin_name.clone();

        thread::Builder::new()
            .name(format!("plugin-{plugin_name}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| plugin.sync(&ctx)));
                match outcome {
                    Ok(Ok(final_results)) => {
                        store_results(&results, final_results);
                        sink.send(RunnerEvent::Success {
                            message: String::new(),
                        });
                        sink.send(RunnerEvent::Done);
                    }
                    Ok(Err(failure)) => {
                        let mut failed = read_results(&results);
                        failed.end_time = chrono::Utc::now();
                        failed.major = MajorCode::Failed;
                        failed.minor = failure.minor;
                        store_results(&results, failed);
                        sink.send(RunnerEvent::Error {
                            message: failure.message,
                            minor: failure.minor,
                        });
                        sink.send(RunnerEvent::Done);
                    }
                    Err(_) => {
                        // A panic leaves no terminal event behind; the
                        // session treats the bare Done as unexpected
                        // termination.
                        tracing::warn!(plugin = %plugin_name, "plugin panicked");
                        sink.send(RunnerEvent::Done);
                    }
                }
                sink.send(RunnerEvent::Destroyed);
            })
            .is_ok()
    }

    fn abort(&mut self, status: SyncStatus) {
        tracing::debug!(plugin = %self.plugin_name, %status, "aborting plugin");
        self.abort.store(true, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn sync_results(&self) -> SyncResults {
        read_results(&self.results)
    }
}

// ---------------------------------------------------------------------------
// Out-of-process runner
// ---------------------------------------------------------------------------

/// Drives a plugin hosted by the `tether-worker` executable.
///
/// The worker is spawned with three positional arguments (plugin name,
/// profile name, plugin library path) and must first register its derived
/// service name; a wrong registration gets the child dropped. Replies are
/// pumped on a thread so `start` never waits on child I/O.
pub struct ProcessPluginRunner {
    plugin_name: String,
    profile_name: String,
    worker_bin: PathBuf,
    plugin_path: PathBuf,
    events: UnboundedSender<EngineEvent>,
    results: Arc<Mutex<SyncResults>>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl ProcessPluginRunner {
    pub fn new(
        plugin_name: String,
        profile_name: String,
        worker_bin: PathBuf,
        plugin_path: PathBuf,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            plugin_name,
            profile_name,
            worker_bin,
            plugin_path,
            events,
            results: Arc::new(Mutex::new(initial_results())),
            child: None,
            stdin: None,
        }
    }

    fn send_command(&mut self, command: &WorkerCommand) {
        let Some(stdin) = self.stdin.as_mut() else {
            tracing::warn!(plugin = %self.plugin_name, "worker stdin not available");
            return;
        };
        match serde_json::to_string(command) {
            Ok(line) => {
                if let Err(err) = writeln!(stdin, "{line}").and_then(|()| stdin.flush()) {
                    tracing::warn!(
                        plugin = %self.plugin_name,
                        error = %err,
                        "failed to write worker command",
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode worker command");
            }
        }
    }
}

impl PluginRunner for ProcessPluginRunner {
    fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    fn start(&mut self) -> bool {
        let mut child = match Command::new(&self.worker_bin)
            .arg(&self.plugin_name)
            .arg(&self.profile_name)
            .arg(&self.plugin_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    worker = %self.worker_bin.display(),
                    error = %err,
                    "failed to spawn worker",
                );
                return false;
            }
        };

        let Some(stdout) = child.stdout.take() else {
            tracing::warn!("worker spawned without captured stdout");
            let _ = child.kill();
            return false;
        };
        self.stdin = child.stdin.take();
        self.child = Some(child);

        let sink = EngineSink {
            profile: self.profile_name.clone(),
            events: self.events.clone(),
        };
        let expected_service = derived_service_name(&self.profile_name);
        let results = self.results.clone();
        let plugin_name = self.plugin_name.clone();

        let spawned = thread::Builder::new()
            .name(format!("worker-{plugin_name}"))
            .spawn(move || pump_worker_replies(stdout, sink, expected_service, results, plugin_name))
            .is_ok();
        if !spawned {
            return false;
        }

        self.send_command(&WorkerCommand::Start);
        true
    }

    fn abort(&mut self, status: SyncStatus) {
        self.send_command(&WorkerCommand::Abort { status });
    }

    fn stop(&mut self) {
        self.send_command(&WorkerCommand::Stop);
    }

    fn sync_results(&self) -> SyncResults {
        read_results(&self.results)
    }
}

impl Drop for ProcessPluginRunner {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

fn pump_worker_replies(
    stdout: std::process::ChildStdout,
    sink: EngineSink,
    expected_service: String,
    results: Arc<Mutex<SyncResults>>,
    plugin_name: String,
) {
    let reader = BufReader::new(stdout);
    let mut registered = false;
    let mut saw_terminal = false;
    let mut saw_done = false;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(plugin = %plugin_name, error = %err, "worker pipe read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply: WorkerReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(plugin = %plugin_name, error = %err, "invalid worker reply");
                continue;
            }
        };

        match reply {
            WorkerReply::Register { service } => {
                if service != expected_service {
                    tracing::warn!(
                        plugin = %plugin_name,
                        service = %service,
                        expected = %expected_service,
                        "worker registered a wrong service name",
                    );
                    sink.send(RunnerEvent::Error {
                        message: "worker registered a wrong service name".to_owned(),
                        minor: MinorCode::InternalError,
                    });
                    sink.send(RunnerEvent::Done);
                    sink.send(RunnerEvent::Destroyed);
                    return;
                }
                registered = true;
            }
            WorkerReply::Event { event } => {
                if !registered {
                    tracing::warn!(plugin = %plugin_name, "worker event before registration");
                    continue;
                }
                match &event {
                    RunnerEvent::Error { .. } | RunnerEvent::Success { .. } => saw_terminal = true,
                    RunnerEvent::Done => saw_done = true,
                    _ => {}
                }
                sink.send(event);
            }
            WorkerReply::Results {
                results: final_results,
            } => {
                store_results(&results, final_results);
            }
        }
    }

    // Child EOF. A missing terminal event means the worker died on us.
    if !saw_done {
        if !saw_terminal {
            tracing::warn!(plugin = %plugin_name, "worker terminated unexpectedly");
        }
        sink.send(RunnerEvent::Done);
    }
    sink.send(RunnerEvent::Destroyed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use tether_core::profile::{Profile, ProfileType};
    use tether_core::SyncLog;

    use crate::plugin::PluginFailure;

    fn sync_profile(name: &str) -> SyncProfile {
        SyncProfile::new(Profile::new(name, ProfileType::Sync), SyncLog::new(name)).unwrap()
    }

    struct ScriptedPlugin {
        outcome: Option<Result<SyncResults, PluginFailure>>,
    }

    impl SyncPlugin for ScriptedPlugin {
        fn name(&self) -> &str {
            "scripted"
        }

        fn sync(&mut self, _ctx: &SessionContext) -> Result<SyncResults, PluginFailure> {
            match self.outcome.take() {
                Some(outcome) => outcome,
                None => panic!("scripted plugin run twice"),
            }
        }
    }

    struct PanickingPlugin;

    impl SyncPlugin for PanickingPlugin {
        fn name(&self) -> &str {
            "panicking"
        }

        fn sync(&mut self, _ctx: &SessionContext) -> Result<SyncResults, PluginFailure> {
            panic!("boom");
        }
    }

    async fn collect_events(
        rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Some(EngineEvent::Runner { event, .. }) = rx.recv().await {
            let destroyed = event == RunnerEvent::Destroyed;
            events.push(event);
            if destroyed {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn thread_runner_success_emits_terminal_then_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ok = SyncResults::new(chrono::Utc::now(), MajorCode::Success, MinorCode::NoError);
        ok.target_id = Some("remote-7".to_owned());

        let mut runner = ThreadPluginRunner::new(
            sync_profile("p"),
            Box::new(ScriptedPlugin {
                outcome: Some(Ok(ok)),
            }),
            tx,
        );
        assert!(runner.start());

        let events = collect_events(&mut rx).await;
        assert_eq!(
            events,
            vec![
                RunnerEvent::Success {
                    message: String::new()
                },
                RunnerEvent::Done,
                RunnerEvent::Destroyed,
            ]
        );
        assert_eq!(runner.sync_results().target_id.as_deref(), Some("remote-7"));
    }

    #[tokio::test]
    async fn thread_runner_failure_carries_minor_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ThreadPluginRunner::new(
            sync_profile("p"),
            Box::new(ScriptedPlugin {
                outcome: Some(Err(PluginFailure::new(
                    "no route",
                    MinorCode::ConnectionError,
                ))),
            }),
            tx,
        );
        assert!(runner.start());

        let events = collect_events(&mut rx).await;
        assert_eq!(
            events[0],
            RunnerEvent::Error {
                message: "no route".to_owned(),
                minor: MinorCode::ConnectionError,
            }
        );
        assert_eq!(runner.sync_results().minor, MinorCode::ConnectionError);
    }

    #[tokio::test]
    async fn thread_runner_panic_emits_bare_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ThreadPluginRunner::new(sync_profile("p"), Box::new(PanickingPlugin), tx);
        assert!(runner.start());

        let events = collect_events(&mut rx).await;
        assert_eq!(events, vec![RunnerEvent::Done, RunnerEvent::Destroyed]);
    }

    #[tokio::test]
    async fn thread_runner_refuses_second_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ThreadPluginRunner::new(
            sync_profile("p"),
            Box::new(ScriptedPlugin {
                outcome: Some(Ok(SyncResults::new(
                    chrono::Utc::now(),
                    MajorCode::Success,
                    MinorCode::NoError,
                ))),
            }),
            tx,
        );
        assert!(runner.start());
        let _ = collect_events(&mut rx).await;
        assert!(!runner.start(), "plugin was already consumed");
    }

    #[test]
    fn service_name_derivation() {
        assert_eq!(derived_service_name("calendar"), "tether.plugin.calendar");
        assert_eq!(
            derived_service_name("123456"),
            "tether.plugin.profile-123456"
        );
        assert_eq!(
            derived_service_name("7days"),
            "tether.plugin.profile-7days"
        );
    }

    #[test]
    fn worker_wire_roundtrip() {
        let command = WorkerCommand::Abort {
            status: SyncStatus::Aborted,
        };
        let line = serde_json::to_string(&command).unwrap();
        assert_eq!(serde_json::from_str::<WorkerCommand>(&line).unwrap(), command);

        let reply = WorkerReply::Event {
            event: RunnerEvent::TransferProgress {
                db: TransferDb::Remote,
                direction: TransferDirection::Outgoing,
                mime: "text/x-vcard".to_owned(),
                committed: 12,
            },
        };
        let line = serde_json::to_string(&reply).unwrap();
        assert_eq!(serde_json::from_str::<WorkerReply>(&line).unwrap(), reply);
    }
}
