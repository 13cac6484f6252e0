//! Per-profile sync session.
//!
//! A session wraps one plugin runner with transport acquisition, storage
//! bookkeeping, and terminal result mapping. It is a plain state machine
//! driven by the engine loop; every started session produces exactly one
//! [`SessionFinished`].

use tether_core::{
    DestinationType, MajorCode, MinorCode, SyncProfile, SyncResults, SyncStatus,
};

use crate::runner::{PluginRunner, RunnerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingTransport,
    Running,
    Aborting,
    Finished,
}

/// Terminal report of a session.
#[derive(Debug, Clone)]
pub struct SessionFinished {
    pub profile: String,
    pub status: SyncStatus,
    pub message: String,
    pub minor: MinorCode,
    pub results: SyncResults,
    pub scheduled: bool,
}

/// What `start` decided.
pub enum StartOutcome {
    /// An on-demand online sync first needs a network session.
    AwaitNetwork,
    /// The plugin runner is up.
    Running,
    /// Startup failed; the session is finished.
    Failed(SessionFinished),
}

pub struct SyncSession {
    profile: SyncProfile,
    runner: Option<Box<dyn PluginRunner>>,
    state: SessionState,
    scheduled: bool,
    aborted: bool,
    started: bool,
    results: SyncResults,
    reserved_storages: Vec<String>,
}

impl SyncSession {
    pub fn new(profile: SyncProfile, scheduled: bool) -> Self {
        let mut results = SyncResults::new(
            chrono::Utc::now(),
            MajorCode::Failed,
            MinorCode::NoError,
        );
        results.scheduled = scheduled;
        Self {
            profile,
            runner: None,
            state: SessionState::Created,
            scheduled,
            aborted: false,
            started: false,
            results,
            reserved_storages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.profile.name()
    }

    pub fn profile(&self) -> &SyncProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    pub fn set_runner(&mut self, runner: Box<dyn PluginRunner>) {
        self.runner = Some(runner);
    }

    /// Storage backends the scheduler reserved for this session.
    pub fn set_reserved_storages(&mut self, backends: Vec<String>) {
        self.reserved_storages = backends;
    }

    pub fn reserved_storages(&self) -> &[String] {
        &self.reserved_storages
    }

    /// Release is idempotent: the list is cleared once taken.
    pub fn take_reserved_storages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.reserved_storages)
    }

    /// Begin the session.
    ///
    /// On-demand syncs to an online destination must acquire a network
    /// session first; the scheduler resolves the request against the
    /// transport layer and calls [`network_session_opened`] or
    /// [`network_session_error`].
    ///
    /// [`network_session_opened`]: Self::network_session_opened
    /// [`network_session_error`]: Self::network_session_error
    pub fn start(&mut self) -> StartOutcome {
        if self.profile.destination_type() == Some(DestinationType::Online) && !self.scheduled {
            self.state = SessionState::AwaitingTransport;
            return StartOutcome::AwaitNetwork;
        }
        self.try_start()
    }

    pub fn network_session_opened(&mut self) -> Option<SessionFinished> {
        match self.try_start() {
            StartOutcome::Failed(finished) => Some(finished),
            _ => None,
        }
    }

    pub fn network_session_error(&mut self) -> SessionFinished {
        tracing::warn!(profile = %self.name(), "network session failed to open");
        self.finish(
            SyncStatus::Error,
            String::new(),
            MinorCode::ConnectionError,
        )
    }

    fn try_start(&mut self) -> StartOutcome {
        let started = self.runner.as_mut().map(|r| r.start()).unwrap_or(false);
        if started {
            self.started = true;
            self.state = SessionState::Running;
            StartOutcome::Running
        } else {
            StartOutcome::Failed(self.finish(
                SyncStatus::Error,
                String::new(),
                MinorCode::InternalError,
            ))
        }
    }

    /// Request termination.
    ///
    /// Before the runner started this finishes immediately without touching
    /// the plugin; afterwards the plugin is asked to abort and the terminal
    /// outcome arrives through its events, stamped `Aborted`.
    pub fn abort(&mut self, status: SyncStatus) -> Option<SessionFinished> {
        if self.is_finished() {
            return None;
        }
        if !self.started {
            tracing::debug!(profile = %self.name(), "abort before start; plugin untouched");
            return Some(self.finish(SyncStatus::Error, String::new(), MinorCode::Aborted));
        }

        self.aborted = true;
        self.state = SessionState::Aborting;
        if let Some(runner) = self.runner.as_mut() {
            runner.abort(status);
        }
        None
    }

    /// Ask the plugin to wind down at its next checkpoint.
    pub fn stop(&mut self) {
        if !self.started {
            tracing::debug!(profile = %self.name(), "stop before start ignored");
            return;
        }
        if let Some(runner) = self.runner.as_mut() {
            runner.stop();
        }
    }

    /// Feed one runner event through the state machine. Returns the
    /// terminal report when the event ends the session.
    pub fn on_runner_event(&mut self, event: RunnerEvent) -> Option<SessionFinished> {
        match event {
            RunnerEvent::Success { message } => {
                let status = if self.aborted {
                    SyncStatus::Aborted
                } else {
                    SyncStatus::Done
                };
                Some(self.finish(status, message, MinorCode::NoError))
            }
            RunnerEvent::Error { message, minor } => {
                Some(self.finish(map_minor_to_status(minor), message, minor))
            }
            RunnerEvent::Done => {
                if self.is_finished() {
                    return None;
                }
                let plugin = self
                    .runner
                    .as_ref()
                    .map(|r| r.plugin_name().to_owned())
                    .unwrap_or_default();
                tracing::warn!(plugin = %plugin, "plugin terminated unexpectedly");
                Some(self.finish(SyncStatus::Error, String::new(), MinorCode::NoError))
            }
            RunnerEvent::Destroyed => {
                self.runner = None;
                None
            }
            // Progress events are relayed by the scheduler.
            _ => None,
        }
    }

    fn finish(
        &mut self,
        status: SyncStatus,
        message: String,
        minor: MinorCode,
    ) -> SessionFinished {
        self.state = SessionState::Finished;

        if let Some(runner) = &self.runner {
            self.results = runner.sync_results();
        }
        self.results.scheduled = self.scheduled;
        match status {
            SyncStatus::Done => {}
            SyncStatus::Aborted => {
                self.results.major = MajorCode::Cancelled;
                self.results.minor = MinorCode::Aborted;
            }
            _ => {
                self.results.major = MajorCode::Failed;
                self.results.minor = minor;
            }
        }
        if self.results.end_time <= self.results.start_time {
            self.results.end_time = chrono::Utc::now();
        }

        SessionFinished {
            profile: self.name().to_owned(),
            status,
            message,
            minor,
            results: self.results.clone(),
            scheduled: self.scheduled,
        }
    }
}

fn map_minor_to_status(minor: MinorCode) -> SyncStatus {
    match minor {
        MinorCode::UnsupportedSyncType => SyncStatus::NotPossible,
        _ => SyncStatus::Error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
