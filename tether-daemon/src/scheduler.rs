//! Admission control and retry policy.
//!
//! The scheduler owns the set of active sessions (one per running profile),
//! a queue of sessions waiting for storage reservations, a list of profiles
//! deferred on connectivity, per-profile retry state, and the alarm queue
//! that drives scheduled syncs. It reacts to profile-store mutations,
//! transport changes, alarm expiries, and terminal session events — always
//! from the engine loop, one event at a time.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use tether_core::profile::KEY_REMOTE_ID;
use tether_core::{
    DestinationType, MajorCode, MinorCode, ProfileChange, ProfileChangeKind, ProfileStore,
    ProfileType, SyncProfile, SyncResults, SyncStatus, SyncType, Transport,
};

use crate::alarms::AlarmQueue;
use crate::booker::StorageBooker;
use crate::events::EngineEvent;
use crate::protocol::WatchEvent;
use crate::runner::{PluginRunner, RunnerEvent};
use crate::session::{SessionFinished, StartOutcome, SyncSession};
use crate::transport::{NetworkSessionOutcome, TransportEvent, TransportTracker};

/// Minor codes that consume a retry interval. `InternalError` and
/// `Aborted` are deliberate non-members; `UnsupportedSyncType` is a
/// permanent condition.
pub const RETRYABLE_MINOR_CODES: &[MinorCode] =
    &[MinorCode::ConnectionError, MinorCode::PluginError];

/// Builds the plugin runner for a profile, or `None` when no plugin is
/// available for it.
pub type RunnerFactory = Box<
    dyn Fn(&SyncProfile, mpsc::UnboundedSender<EngineEvent>) -> Option<Box<dyn PluginRunner>>
        + Send,
>;

pub struct Scheduler {
    store: ProfileStore,
    booker: StorageBooker,
    transports: TransportTracker,
    runner_factory: RunnerFactory,
    events: mpsc::UnboundedSender<EngineEvent>,
    watch: broadcast::Sender<WatchEvent>,
    sessions: HashMap<String, SyncSession>,
    /// Sessions whose storages were busy, in arrival order.
    queue: VecDeque<SyncSession>,
    /// Profiles deferred until their required transport comes up.
    waiting_transport: Vec<String>,
    /// Remaining retry intervals per profile, consumed front to back.
    retries: HashMap<String, VecDeque<u32>>,
    /// Profiles whose pending alarm is a retry; retry instants take
    /// precedence over the regular schedule.
    retry_pending: HashSet<String>,
    alarms: AlarmQueue,
    /// Coalesced profile-change triggers awaiting the quiet period.
    trigger_queue: VecDeque<(String, ProfileChangeKind)>,
    trigger_deadline: Option<DateTime<Utc>>,
    quiet_period: Duration,
}

impl Scheduler {
    pub fn new(
        store: ProfileStore,
        booker: StorageBooker,
        transports: TransportTracker,
        runner_factory: RunnerFactory,
        events: mpsc::UnboundedSender<EngineEvent>,
        watch: broadcast::Sender<WatchEvent>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            store,
            booker,
            transports,
            runner_factory,
            events,
            watch,
            sessions: HashMap::new(),
            queue: VecDeque::new(),
            waiting_transport: Vec::new(),
            retries: HashMap::new(),
            retry_pending: HashSet::new(),
            alarms: AlarmQueue::new(),
            trigger_queue: VecDeque::new(),
            trigger_deadline: None,
            quiet_period,
        }
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn transports(&self) -> &TransportTracker {
        &self.transports
    }

    /// Arm alarms for every enabled, visible sync profile on startup.
    pub fn bootstrap(&mut self, now: DateTime<Utc>) {
        let names: Vec<String> = self
            .store
            .visible_sync_profiles()
            .iter()
            .filter(|p| p.is_enabled())
            .map(|p| p.name().to_owned())
            .collect();
        for name in names {
            self.reschedule(&name, now);
        }
        tracing::info!(scheduled = self.alarms.len(), "scheduler bootstrapped");
    }

    /// Earliest instant the engine loop must wake up at.
    pub fn next_wakeup(&mut self) -> Option<DateTime<Utc>> {
        match (self.alarms.next_deadline(), self.trigger_deadline) {
            (Some(alarm), Some(trigger)) => Some(alarm.min(trigger)),
            (alarm, trigger) => alarm.or(trigger),
        }
    }

    // -- sync admission -----------------------------------------------------

    /// Start (or queue) a sync for `name`. Returns whether the request was
    /// accepted; a refused request has already produced status events and a
    /// failed log entry.
    pub fn start_sync(&mut self, name: &str, scheduled: bool, now: DateTime<Utc>) -> bool {
        let accepted = self.start_sync_inner(name, scheduled, now);
        self.drain_queue(now);
        accepted
    }

    fn start_sync_inner(&mut self, name: &str, scheduled: bool, now: DateTime<Utc>) -> bool {
        // A direct request supersedes any pending change trigger.
        self.trigger_queue.retain(|(queued, _)| queued != name);

        if self.sessions.contains_key(name) {
            tracing::debug!(profile = name, "sync already in progress");
            return true;
        }
        if self.queue.iter().any(|s| s.name() == name) {
            tracing::debug!(profile = name, "sync request already in queue");
            self.emit_status(name, SyncStatus::Queued, "", MinorCode::NoError);
            return true;
        }
        if !scheduled {
            // Manual syncs run on any connection.
            self.waiting_transport.retain(|waiting| waiting != name);
        }

        let Some(profile) = self.store.sync_profile(name) else {
            tracing::warn!(profile = name, "profile not found");
            self.fail_without_session(name, scheduled, "profile not found", now);
            return false;
        };
        if !profile.is_enabled() {
            tracing::warn!(profile = name, "profile is disabled, not starting sync");
            self.fail_without_session(name, scheduled, "profile is disabled", now);
            return false;
        }
        if profile.client_profile().is_none() {
            tracing::warn!(profile = name, "profile has no client sub-profile");
            self.fail_without_session(name, scheduled, "no client sub-profile", now);
            return false;
        }

        self.register_retries(&profile);

        let backends = profile.storage_backend_names();
        let mut session = SyncSession::new(profile, scheduled);
        if !self.booker.reserve(&backends, name) {
            tracing::debug!(profile = name, "needed storages in use, queuing sync request");
            self.queue.push_back(session);
            self.emit_status(name, SyncStatus::Queued, "", MinorCode::NoError);
            return true;
        }
        session.set_reserved_storages(backends);
        self.launch(session, now)
    }

    /// Scheduler-fired start: checks the profile's required transport and
    /// defers until it is reported available.
    fn start_scheduled(&mut self, name: &str, now: DateTime<Utc>) {
        let Some(profile) = self.store.sync_profile(name) else {
            tracing::debug!(profile = name, "scheduled profile no longer exists");
            return;
        };
        if !profile.is_enabled() {
            tracing::debug!(profile = name, "scheduled profile is disabled");
            return;
        }

        let required = profile.required_transport();
        if !self.transports.is_available(required) {
            tracing::info!(
                profile = name,
                transport = %required,
                "transport unavailable, deferring scheduled sync",
            );
            if !self.waiting_transport.iter().any(|n| n == name) {
                self.waiting_transport.push(name.to_owned());
            }
            self.emit_status(
                name,
                SyncStatus::NotPossible,
                "waiting for connectivity",
                MinorCode::ConnectionError,
            );
            return;
        }

        self.start_sync_inner(name, true, now);
    }

    /// Abort an active or queued sync. Returns whether one was found.
    pub fn abort_sync(&mut self, name: &str, now: DateTime<Utc>) -> bool {
        if self.sessions.contains_key(name) {
            let finished = self
                .sessions
                .get_mut(name)
                .and_then(|session| session.abort(SyncStatus::Aborted));
            if let Some(finished) = finished {
                if let Some(session) = self.sessions.remove(name) {
                    self.conclude(session, finished, now);
                }
            }
            self.drain_queue(now);
            return true;
        }

        if let Some(pos) = self.queue.iter().position(|s| s.name() == name) {
            if let Some(mut session) = self.queue.remove(pos) {
                if let Some(finished) = session.abort(SyncStatus::Aborted) {
                    self.conclude(session, finished, now);
                }
            }
            self.drain_queue(now);
            return true;
        }

        tracing::debug!(profile = name, "no sync to abort");
        false
    }

    // -- event handlers -----------------------------------------------------

    /// Route a plugin runner event to its session; progress is relayed to
    /// watchers, terminal events tear the session down.
    pub fn handle_runner_event(&mut self, profile: &str, event: RunnerEvent, now: DateTime<Utc>) {
        match &event {
            RunnerEvent::TransferProgress {
                db,
                direction,
                mime,
                committed,
            } => {
                self.emit_watch(WatchEvent::TransferProgress {
                    profile: profile.to_owned(),
                    db: *db,
                    direction: *direction,
                    mime: mime.clone(),
                    committed: *committed,
                });
                return;
            }
            RunnerEvent::StorageAcquired { mime } => {
                self.emit_watch(WatchEvent::StorageAcquired {
                    profile: profile.to_owned(),
                    mime: mime.clone(),
                });
                return;
            }
            RunnerEvent::SyncProgressDetail { code } => {
                self.emit_status(
                    profile,
                    SyncStatus::Progress,
                    &code.to_string(),
                    MinorCode::NoError,
                );
                return;
            }
            _ => {}
        }

        let Some(session) = self.sessions.get_mut(profile) else {
            // Late events (e.g. Destroyed) after teardown are expected.
            tracing::debug!(profile, "runner event for inactive session");
            return;
        };
        if let Some(finished) = session.on_runner_event(event) {
            if let Some(session) = self.sessions.remove(profile) {
                self.conclude(session, finished, now);
            }
        }
        self.drain_queue(now);
    }

    /// Apply a connectivity observation: start deferred syncs when their
    /// transport comes up, abort online sessions when the internet drops.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: DateTime<Utc>) {
        let Some((kind, available)) = self.transports.apply(event) else {
            return;
        };

        if available {
            let waiting = std::mem::take(&mut self.waiting_transport);
            for name in waiting {
                match self.store.sync_profile(&name).map(|p| p.required_transport()) {
                    Some(required) if required == kind => {
                        tracing::info!(profile = %name, transport = %kind, "transport up, starting deferred sync");
                        self.start_sync_inner(&name, true, now);
                    }
                    Some(_) => self.waiting_transport.push(name),
                    None => {}
                }
            }
        } else if kind == Transport::Internet {
            let online: Vec<String> = self
                .sessions
                .values()
                .filter(|s| s.profile().destination_type() == Some(DestinationType::Online))
                .map(|s| s.name().to_owned())
                .collect();
            for name in online {
                tracing::info!(profile = %name, "internet lost, aborting online session");
                let finished = self
                    .sessions
                    .get_mut(&name)
                    .and_then(|session| session.abort(SyncStatus::Error));
                if let Some(finished) = finished {
                    if let Some(session) = self.sessions.remove(&name) {
                        self.conclude(session, finished, now);
                    }
                }
            }
        }

        self.drain_queue(now);
    }

    /// React to a store mutation: coalesce sync triggers, refresh alarms,
    /// and forget removed profiles.
    pub fn handle_profile_change(&mut self, change: ProfileChange, now: DateTime<Utc>) {
        match change.kind {
            ProfileChangeKind::Added | ProfileChangeKind::Modified => {
                if !self.trigger_queue.iter().any(|(name, _)| *name == change.name) {
                    self.trigger_queue.push_back((change.name.clone(), change.kind));
                }
                self.trigger_deadline = Some(now + self.quiet_period);
                self.reschedule(&change.name, now);
            }
            ProfileChangeKind::Removed => {
                self.trigger_queue.retain(|(name, _)| *name != change.name);
                self.waiting_transport.retain(|name| *name != change.name);
                self.retries.remove(&change.name);
                self.retry_pending.remove(&change.name);
                self.alarms.remove(&change.name);
                if let Some(pos) = self.queue.iter().position(|s| s.name() == change.name) {
                    self.queue.remove(pos);
                    tracing::debug!(profile = %change.name, "dropped queued sync for removed profile");
                }
            }
            ProfileChangeKind::LogsModified => {}
        }
    }

    /// Fire everything that is due: the change-trigger quiet period and
    /// per-profile alarms (scheduled fires and retries).
    pub fn handle_deadlines(&mut self, now: DateTime<Utc>) {
        if self.trigger_deadline.is_some_and(|deadline| deadline <= now) {
            self.trigger_deadline = None;
            let triggers: Vec<(String, ProfileChangeKind)> =
                self.trigger_queue.drain(..).collect();
            for (name, kind) in triggers {
                let enabled = self
                    .store
                    .sync_profile(&name)
                    .map(|p| p.is_enabled())
                    .unwrap_or(false);
                if !enabled {
                    continue;
                }
                match kind {
                    ProfileChangeKind::Added => {
                        tracing::debug!(profile = %name, "starting sync for added profile");
                        self.start_sync_inner(&name, false, now);
                    }
                    ProfileChangeKind::Modified => {
                        tracing::debug!(profile = %name, "starting sync for modified profile");
                        self.start_scheduled(&name, now);
                    }
                    _ => {}
                }
            }
        }

        for name in self.alarms.pop_due(now) {
            self.retry_pending.remove(&name);
            self.start_scheduled(&name, now);
        }

        self.drain_queue(now);
    }

    // -- profile mutations over IPC ------------------------------------------

    pub fn update_profile_xml(
        &mut self,
        document: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        let Some(profile) = ProfileStore::profile_from_xml(document) else {
            return Err("cannot parse profile document".to_owned());
        };
        match self.store.update_profile(&profile) {
            Ok(change) => {
                let name = change.name.clone();
                self.handle_profile_change(change, now);
                Ok(name)
            }
            Err(err) => Err(err.to_string()),
        }
    }

    pub fn remove_profile(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), String> {
        match self.store.remove(name, ProfileType::Sync) {
            Ok(change) => {
                self.handle_profile_change(change, now);
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Introspection payload for the status command.
    pub fn snapshot(&mut self) -> serde_json::Value {
        let mut active: Vec<&str> = self.sessions.keys().map(String::as_str).collect();
        active.sort_unstable();
        let queued: Vec<&str> = self.queue.iter().map(|s| s.name()).collect();
        let transports = self.transports.snapshot();

        json!({
            "active": active,
            "queued": queued,
            "waiting_transport": self.waiting_transport,
            "transports": {
                "usb": transports.get(&Transport::Usb).copied().unwrap_or(false),
                "bt": transports.get(&Transport::Bt).copied().unwrap_or(false),
                "internet": transports.get(&Transport::Internet).copied().unwrap_or(false),
                "internet_medium": self.transports.internet_medium(),
            },
            "pending_alarms": self.alarms.len(),
            "next_alarm": self.next_wakeup().map(|at| at.to_rfc3339()),
        })
    }

    // -- internals ----------------------------------------------------------

    fn launch(&mut self, mut session: SyncSession, now: DateTime<Utc>) -> bool {
        let name = session.name().to_owned();
        match (self.runner_factory)(session.profile(), self.events.clone()) {
            Some(runner) => session.set_runner(runner),
            None => {
                tracing::warn!(profile = %name, "no plugin available for profile");
            }
        }

        match session.start() {
            StartOutcome::Running => {
                self.sessions.insert(name.clone(), session);
                self.emit_status(&name, SyncStatus::Started, "", MinorCode::NoError);
                true
            }
            StartOutcome::AwaitNetwork => match self.transports.request_network_session() {
                NetworkSessionOutcome::Opened => match session.network_session_opened() {
                    None => {
                        self.sessions.insert(name.clone(), session);
                        self.emit_status(&name, SyncStatus::Started, "", MinorCode::NoError);
                        true
                    }
                    Some(finished) => {
                        self.conclude(session, finished, now);
                        false
                    }
                },
                NetworkSessionOutcome::Error => {
                    let finished = session.network_session_error();
                    self.conclude(session, finished, now);
                    false
                }
            },
            StartOutcome::Failed(finished) => {
                self.conclude(session, finished, now);
                false
            }
        }
    }

    /// Tear down a finished session: release storages, persist results,
    /// consume retry intervals, reschedule, and report the terminal status.
    fn conclude(&mut self, mut session: SyncSession, finished: SessionFinished, now: DateTime<Utc>) {
        let name = finished.profile.clone();
        self.booker.release(&session.take_reserved_storages());

        let profile_exists = self.store.load(&name, ProfileType::Sync).is_some();
        if profile_exists {
            // Persist the remote peer id after the first successful run.
            // This mutation deliberately does not enqueue a change trigger.
            if finished.status == SyncStatus::Done
                && session.profile().log().last_results().is_none()
            {
                if let Some(target) = finished.results.target_id.clone() {
                    let mut profile = session.profile().profile().clone();
                    profile.set_key(KEY_REMOTE_ID, target);
                    if let Err(err) = self.store.update_profile(&profile) {
                        tracing::warn!(profile = %name, error = %err, "failed to persist remote id");
                    }
                }
            }
            if let Err(err) = self.store.save_results(&name, finished.results.clone()) {
                tracing::warn!(profile = %name, error = %err, "failed to save sync results");
            }
        } else {
            tracing::debug!(profile = %name, "profile removed while syncing; results dropped");
        }

        match finished.status {
            SyncStatus::Done => {
                self.retries.remove(&name);
                if self.retry_pending.remove(&name) {
                    self.alarms.remove(&name);
                }
            }
            SyncStatus::Error | SyncStatus::NotPossible => {
                if RETRYABLE_MINOR_CODES.contains(&finished.minor) {
                    if let Some(minutes) = self.next_retry(&name) {
                        let at = now + Duration::minutes(i64::from(minutes));
                        tracing::info!(profile = %name, minutes, "sync retry scheduled");
                        self.alarms.set(&name, at);
                        self.retry_pending.insert(name.clone());
                    }
                } else {
                    self.retries.remove(&name);
                }
            }
            _ => {}
        }

        if finished.scheduled && profile_exists {
            self.reschedule(&name, now);
        }

        self.emit_status(&name, finished.status, &finished.message, finished.minor);
    }

    /// Consume the next retry interval for `name`; clears the retry state
    /// on exhaustion.
    fn next_retry(&mut self, name: &str) -> Option<u32> {
        let intervals = self.retries.get_mut(name)?;
        match intervals.pop_front() {
            Some(minutes) => {
                tracing::debug!(
                    profile = name,
                    remaining = intervals.len(),
                    "retry interval consumed",
                );
                Some(minutes)
            }
            None => {
                tracing::debug!(profile = name, "retry sequence exhausted");
                self.retries.remove(name);
                None
            }
        }
    }

    fn register_retries(&mut self, profile: &SyncProfile) {
        let intervals = profile.retry_intervals();
        if !intervals.is_empty() && !self.retries.contains_key(profile.name()) {
            self.retries
                .insert(profile.name().to_owned(), intervals.into());
        }
    }

    /// Refresh the profile's regular alarm from its schedule. A pending
    /// retry instant always wins.
    fn reschedule(&mut self, name: &str, now: DateTime<Utc>) {
        if self.retry_pending.contains(name) {
            return;
        }
        let Some(profile) = self.store.sync_profile(name) else {
            self.alarms.remove(name);
            return;
        };
        if !profile.is_enabled() || profile.sync_type() != SyncType::Scheduled {
            self.alarms.remove(name);
            return;
        }

        let reference = profile
            .log()
            .last_results()
            .map(|r| r.end_time)
            .unwrap_or(now);
        match profile.schedule().and_then(|s| s.next_sync_time(reference)) {
            Some(at) => {
                tracing::debug!(profile = name, at = %at, "sync scheduled");
                self.alarms.set(name, at);
            }
            None => {
                tracing::debug!(profile = name, "no valid next sync time");
                self.alarms.remove(name);
            }
        }
    }

    fn fail_without_session(
        &mut self,
        name: &str,
        scheduled: bool,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let mut results = SyncResults::new(now, MajorCode::Failed, MinorCode::InternalError);
        results.scheduled = scheduled;
        if self.store.load(name, ProfileType::Sync).is_some() {
            if let Err(err) = self.store.save_results(name, results) {
                tracing::warn!(profile = name, error = %err, "failed to save sync results");
            }
        }
        self.emit_status(name, SyncStatus::Error, message, MinorCode::InternalError);
    }

    fn drain_queue(&mut self, now: DateTime<Utc>) {
        while self.start_next(now) {}
    }

    /// Try to start the head of the storage queue. Returns whether the
    /// queue advanced.
    fn start_next(&mut self, now: DateTime<Utc>) -> bool {
        let (name, backends) = match self.queue.front() {
            Some(session) => (
                session.name().to_owned(),
                session.profile().storage_backend_names(),
            ),
            None => return false,
        };
        if !self.booker.reserve(&backends, &name) {
            tracing::debug!(profile = %name, "needed storages still in use");
            return false;
        }
        let Some(mut session) = self.queue.pop_front() else {
            return false;
        };
        session.set_reserved_storages(backends);
        self.launch(session, now);
        true
    }

    fn emit_status(&self, profile: &str, status: SyncStatus, message: &str, minor: MinorCode) {
        tracing::info!(profile, %status, "sync status");
        self.emit_watch(WatchEvent::Status {
            profile: profile.to_owned(),
            status,
            message: message.to_owned(),
            minor,
        });
    }

    fn emit_watch(&self, event: WatchEvent) {
        // No receivers is fine; watchers come and go.
        let _ = self.watch.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    use tether_core::profile::{
        Profile, KEY_DESTINATION_TYPE, KEY_ENABLED, KEY_RETRY_INTERVALS, VALUE_ONLINE,
    };
    use tether_core::{Paths, SyncSchedule};

    struct ManualRunner {
        aborted: Arc<Mutex<Vec<SyncStatus>>>,
    }

    impl PluginRunner for ManualRunner {
        fn plugin_name(&self) -> &str {
            "manual"
        }

        fn start(&mut self) -> bool {
            true
        }

        fn abort(&mut self, status: SyncStatus) {
            self.aborted.lock().unwrap().push(status);
        }

        fn stop(&mut self) {}

        fn sync_results(&self) -> SyncResults {
            SyncResults::new(Utc::now(), MajorCode::Success, MinorCode::NoError)
        }
    }

    struct Harness {
        scheduler: Scheduler,
        _events_rx: UnboundedReceiver<EngineEvent>,
        watch_rx: broadcast::Receiver<WatchEvent>,
        aborted: Arc<Mutex<Vec<SyncStatus>>>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = ProfileStore::new(Paths::new(
                dir.path().join("primary"),
                dir.path().join("secondary"),
            ));
            let transports = TransportTracker::new();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (watch_tx, watch_rx) = broadcast::channel(64);
            let aborted: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));

            let factory_aborted = aborted.clone();
            let factory: RunnerFactory = Box::new(move |_, _| {
                Some(Box::new(ManualRunner {
                    aborted: factory_aborted.clone(),
                }))
            });

            let scheduler = Scheduler::new(
                store,
                StorageBooker::new(),
                transports,
                factory,
                events_tx,
                watch_tx,
                Duration::seconds(30),
            );
            Self {
                scheduler,
                _events_rx: events_rx,
                watch_rx,
                aborted,
                _dir: dir,
            }
        }

        fn add_profile(&mut self, profile: &Profile) {
            self.scheduler.store.save(profile).unwrap();
        }

        fn statuses(&mut self) -> Vec<(String, SyncStatus)> {
            let mut seen = Vec::new();
            while let Ok(event) = self.watch_rx.try_recv() {
                if let WatchEvent::Status { profile, status, .. } = event {
                    seen.push((profile, status));
                }
            }
            seen
        }

        fn finish_with(&mut self, profile: &str, event: RunnerEvent, now: DateTime<Utc>) {
            self.scheduler.handle_runner_event(profile, event, now);
            self.scheduler
                .handle_runner_event(profile, RunnerEvent::Done, now);
        }

        fn active(&self) -> Vec<&str> {
            self.scheduler.sessions.keys().map(String::as_str).collect()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn profile_with_storages(name: &str, storages: &[&str]) -> Profile {
        let mut p = Profile::new(name, ProfileType::Sync);
        p.sub_profiles
            .push(Profile::new("loopback", ProfileType::Client));
        for storage in storages {
            let mut sub = Profile::new(*storage, ProfileType::Storage);
            sub.set_key(KEY_ENABLED, "true");
            p.sub_profiles.push(sub);
        }
        p
    }

    #[test]
    fn storage_exclusion_queues_and_resumes() {
        // S3: P1 holds {calendar, contacts}; P2 requires {contacts} and must
        // wait until P1 terminates.
        let mut h = Harness::new();
        h.add_profile(&profile_with_storages("p1", &["calendar", "contacts"]));
        h.add_profile(&profile_with_storages("p2", &["contacts"]));

        assert!(h.scheduler.start_sync("p1", false, t0()));
        assert_eq!(h.active(), vec!["p1"]);

        assert!(h.scheduler.start_sync("p2", false, t0()));
        assert_eq!(h.active(), vec!["p1"], "p2 must not start while storages are held");
        assert!(h
            .statuses()
            .contains(&(("p2".into(), SyncStatus::Queued))));

        h.finish_with(
            "p1",
            RunnerEvent::Success {
                message: String::new(),
            },
            t0(),
        );

        assert_eq!(h.active(), vec!["p2"], "queued sync starts after release");
        let statuses = h.statuses();
        assert!(statuses.contains(&("p1".into(), SyncStatus::Done)));
        assert!(statuses.contains(&("p2".into(), SyncStatus::Started)));
    }

    #[test]
    fn parallel_invocations_for_same_profile_are_refused() {
        let mut h = Harness::new();
        h.add_profile(&profile_with_storages("p", &[]));

        assert!(h.scheduler.start_sync("p", false, t0()));
        assert!(h.scheduler.start_sync("p", false, t0()));
        assert_eq!(h.scheduler.sessions.len(), 1);
    }

    #[test]
    fn retry_sequence_is_bounded() {
        // S4: retry_intervals = [1, 5, 15]. Three retries follow three
        // failures; the fourth failure must not schedule another one.
        let mut h = Harness::new();
        let mut p = profile_with_storages("flaky", &[]);
        p.set_key(KEY_RETRY_INTERVALS, "1,5,15");
        h.add_profile(&p);
        h.scheduler
            .transports
            .apply(TransportEvent::Usb { connected: true });

        let mut now = t0();
        assert!(h.scheduler.start_sync("flaky", false, now));

        for expected_minutes in [1i64, 5, 15] {
            h.finish_with(
                "flaky",
                RunnerEvent::Error {
                    message: "down".into(),
                    minor: MinorCode::ConnectionError,
                },
                now,
            );
            let deadline = h.scheduler.alarms.deadline("flaky").expect("retry alarm");
            assert_eq!(deadline, now + Duration::minutes(expected_minutes));

            // Fire the retry.
            now = deadline;
            h.scheduler.handle_deadlines(now);
            assert_eq!(h.active(), vec!["flaky"], "retry session started");
        }

        // Fourth failure: the sequence is exhausted.
        h.finish_with(
            "flaky",
            RunnerEvent::Error {
                message: "down".into(),
                minor: MinorCode::ConnectionError,
            },
            now,
        );
        assert!(
            !h.scheduler.alarms.is_pending("flaky"),
            "no retry after exhaustion"
        );
        assert!(h.scheduler.retries.get("flaky").is_none());
    }

    #[test]
    fn success_clears_retry_state() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("flaky", &[]);
        p.set_key(KEY_RETRY_INTERVALS, "1,5");
        h.add_profile(&p);
        h.scheduler
            .transports
            .apply(TransportEvent::Usb { connected: true });

        let now = t0();
        assert!(h.scheduler.start_sync("flaky", false, now));
        h.finish_with(
            "flaky",
            RunnerEvent::Error {
                message: "down".into(),
                minor: MinorCode::ConnectionError,
            },
            now,
        );
        assert!(h.scheduler.alarms.is_pending("flaky"));

        // Manual sync succeeds before the retry fires.
        assert!(h.scheduler.start_sync("flaky", false, now));
        h.finish_with(
            "flaky",
            RunnerEvent::Success {
                message: String::new(),
            },
            now,
        );

        assert!(!h.scheduler.alarms.is_pending("flaky"));
        assert!(h.scheduler.retries.get("flaky").is_none());

        // The next failure starts a fresh sequence from the first interval.
        assert!(h.scheduler.start_sync("flaky", false, now));
        h.finish_with(
            "flaky",
            RunnerEvent::Error {
                message: "down".into(),
                minor: MinorCode::ConnectionError,
            },
            now,
        );
        assert_eq!(
            h.scheduler.alarms.deadline("flaky"),
            Some(now + Duration::minutes(1))
        );
    }

    #[test]
    fn non_retryable_failures_do_not_consume_intervals() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("p", &[]);
        p.set_key(KEY_RETRY_INTERVALS, "1");
        h.add_profile(&p);

        assert!(h.scheduler.start_sync("p", false, t0()));
        h.finish_with(
            "p",
            RunnerEvent::Error {
                message: "bad".into(),
                minor: MinorCode::UnsupportedSyncType,
            },
            t0(),
        );
        assert!(!h.scheduler.alarms.is_pending("p"));
    }

    #[test]
    fn transport_deferral_starts_on_availability() {
        // S6: the scheduled instant arrives while the internet is down; the
        // session is created only when the tracker reports it up.
        let mut h = Harness::new();
        let mut p = profile_with_storages("cloud", &[]);
        p.set_key(KEY_DESTINATION_TYPE, VALUE_ONLINE);
        p.schedule = Some(SyncSchedule {
            enabled: true,
            interval_minutes: 30,
            ..SyncSchedule::default()
        });
        h.add_profile(&p);

        h.scheduler.bootstrap(t0());
        let deadline = h.scheduler.alarms.deadline("cloud").expect("alarm armed");

        h.scheduler.handle_deadlines(deadline);
        assert!(h.active().is_empty(), "no session without connectivity");
        assert!(h
            .scheduler
            .waiting_transport
            .contains(&"cloud".to_owned()));
        assert!(h
            .statuses()
            .contains(&("cloud".into(), SyncStatus::NotPossible)));

        h.scheduler.handle_transport_event(
            TransportEvent::Internet {
                online: true,
                medium: Some("wifi".into()),
            },
            deadline + Duration::minutes(3),
        );
        assert_eq!(h.active(), vec!["cloud"], "deferred sync starts on transport up");
    }

    #[test]
    fn internet_loss_aborts_online_sessions() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("cloud", &[]);
        p.set_key(KEY_DESTINATION_TYPE, VALUE_ONLINE);
        h.add_profile(&p);
        h.add_profile(&profile_with_storages("local", &[]));

        h.scheduler.handle_transport_event(
            TransportEvent::Internet {
                online: true,
                medium: None,
            },
            t0(),
        );
        assert!(h.scheduler.start_sync("cloud", false, t0()));
        assert!(h.scheduler.start_sync("local", false, t0()));

        h.scheduler.handle_transport_event(
            TransportEvent::Internet {
                online: false,
                medium: None,
            },
            t0(),
        );

        assert_eq!(h.aborted.lock().unwrap().as_slice(), &[SyncStatus::Error]);
        let mut active = h.active();
        active.sort_unstable();
        assert_eq!(active, vec!["cloud", "local"], "sessions stay until the plugin reports back");
    }

    #[test]
    fn on_demand_online_sync_without_internet_fails_with_connection_error() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("cloud", &[]);
        p.set_key(KEY_DESTINATION_TYPE, VALUE_ONLINE);
        h.add_profile(&p);

        assert!(!h.scheduler.start_sync("cloud", false, t0()));
        let statuses = h.statuses();
        assert!(statuses.contains(&("cloud".into(), SyncStatus::Error)));
        let log = h.scheduler.store.load_log("cloud").expect("results logged");
        assert_eq!(
            log.last_results().unwrap().minor,
            MinorCode::ConnectionError
        );
    }

    #[test]
    fn unknown_profile_reports_internal_error() {
        let mut h = Harness::new();
        assert!(!h.scheduler.start_sync("ghost", false, t0()));
        assert!(h
            .statuses()
            .contains(&("ghost".into(), SyncStatus::Error)));
    }

    #[test]
    fn abort_of_queued_session_finishes_without_plugin() {
        let mut h = Harness::new();
        h.add_profile(&profile_with_storages("p1", &["contacts"]));
        h.add_profile(&profile_with_storages("p2", &["contacts"]));

        assert!(h.scheduler.start_sync("p1", false, t0()));
        assert!(h.scheduler.start_sync("p2", false, t0()));
        assert!(h.scheduler.abort_sync("p2", t0()));

        let statuses = h.statuses();
        assert!(statuses
            .iter()
            .any(|(p, s)| p == "p2" && *s == SyncStatus::Error));
        assert!(h.aborted.lock().unwrap().is_empty(), "plugin never touched");
    }

    #[test]
    fn profile_change_triggers_sync_after_quiet_period() {
        let mut h = Harness::new();
        let p = profile_with_storages("fresh", &[]);

        let now = t0();
        let change = h.scheduler.store.update_profile(&p).unwrap();
        h.scheduler.handle_profile_change(change, now);
        assert!(h.active().is_empty(), "trigger waits for the quiet period");

        let wakeup = h.scheduler.next_wakeup().expect("trigger deadline");
        assert_eq!(wakeup, now + Duration::seconds(30));

        h.scheduler.handle_deadlines(wakeup);
        assert_eq!(h.active(), vec!["fresh"]);
    }

    #[test]
    fn removed_profile_is_fully_forgotten() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("gone", &[]);
        p.schedule = Some(SyncSchedule {
            enabled: true,
            interval_minutes: 10,
            ..SyncSchedule::default()
        });
        h.add_profile(&p);
        h.scheduler.bootstrap(t0());
        assert!(h.scheduler.alarms.is_pending("gone"));

        h.scheduler.remove_profile("gone", t0()).unwrap();
        assert!(!h.scheduler.alarms.is_pending("gone"));
        assert!(h.scheduler.next_wakeup().is_none());
    }

    #[test]
    fn scheduled_session_is_rescheduled_after_finish() {
        let mut h = Harness::new();
        let mut p = profile_with_storages("tick", &[]);
        p.schedule = Some(SyncSchedule {
            enabled: true,
            interval_minutes: 30,
            ..SyncSchedule::default()
        });
        h.add_profile(&p);
        h.scheduler
            .transports
            .apply(TransportEvent::Usb { connected: true });

        h.scheduler.bootstrap(t0());
        let first = h.scheduler.alarms.deadline("tick").expect("armed");
        h.scheduler.handle_deadlines(first);
        assert_eq!(h.active(), vec!["tick"]);

        h.finish_with(
            "tick",
            RunnerEvent::Success {
                message: String::new(),
            },
            first,
        );
        assert!(
            h.scheduler.alarms.deadline("tick").expect("re-armed") > first,
            "next fire must be in the future"
        );
    }
}
