//! The plugin boundary.
//!
//! A [`SyncPlugin`] performs the actual data exchange for one profile. The
//! daemon never interprets plugin payloads; it only starts plugins, relays
//! their progress, and reacts to their terminal outcome. Plugins run off
//! the event loop — on a worker thread in-process, or inside the
//! `tether-worker` executable out-of-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_core::{MinorCode, SyncProfile, SyncResults};

use crate::runner::{RunnerEvent, TransferDb, TransferDirection};

/// Terminal failure reported by a plugin.
#[derive(Debug, Clone)]
pub struct PluginFailure {
    pub message: String,
    pub minor: MinorCode,
}

impl PluginFailure {
    pub fn new(message: impl Into<String>, minor: MinorCode) -> Self {
        Self {
            message: message.into(),
            minor,
        }
    }
}

/// Where a plugin's progress events go; implemented by the in-process
/// runner (engine channel) and by the worker executable (stdout).
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: RunnerEvent);
}

/// Execution context handed to a running plugin.
///
/// The abort and stop flags are set asynchronously by the owning session;
/// a well-behaved plugin polls them between work items.
pub struct SessionContext {
    profile: SyncProfile,
    abort: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl SessionContext {
    pub fn new(
        profile: SyncProfile,
        abort: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            profile,
            abort,
            stop,
            sink,
        }
    }

    pub fn profile(&self) -> &SyncProfile {
        &self.profile
    }

    /// Immediate termination was requested.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Graceful termination was requested; finish at the next checkpoint.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Report committed items for one database/direction pair. Counts must
    /// be monotone non-decreasing per pair.
    pub fn transfer_progress(
        &self,
        db: TransferDb,
        direction: TransferDirection,
        mime: impl Into<String>,
        committed: u64,
    ) {
        self.sink.emit(RunnerEvent::TransferProgress {
            db,
            direction,
            mime: mime.into(),
            committed,
        });
    }

    pub fn storage_acquired(&self, mime: impl Into<String>) {
        self.sink.emit(RunnerEvent::StorageAcquired { mime: mime.into() });
    }

    pub fn progress_detail(&self, code: i32) {
        self.sink.emit(RunnerEvent::SyncProgressDetail { code });
    }
}

/// A plugin that knows how to sync one kind of service or peer.
pub trait SyncPlugin: Send {
    fn name(&self) -> &str;

    /// Run the sync to completion, emitting progress through `ctx`.
    fn sync(&mut self, ctx: &SessionContext) -> Result<SyncResults, PluginFailure>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type PluginFactory = Box<dyn Fn() -> Box<dyn SyncPlugin> + Send + Sync>;

/// In-process plugin factories, keyed by plugin name (the name of the
/// profile's client sub-profile).
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("loopback", || Box::new(LoopbackPlugin));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SyncPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn SyncPlugin>> {
        self.factories.get(name).map(|factory| factory())
    }
}

// ---------------------------------------------------------------------------
// Built-in loopback plugin
// ---------------------------------------------------------------------------

/// Trivial plugin that immediately succeeds; used for demos and end-to-end
/// exercises of the session machinery.
pub struct LoopbackPlugin;

impl SyncPlugin for LoopbackPlugin {
    fn name(&self) -> &str {
        "loopback"
    }

    fn sync(&mut self, ctx: &SessionContext) -> Result<SyncResults, PluginFailure> {
        let start = chrono::Utc::now();
        for backend in ctx.profile().storage_backend_names() {
            if ctx.aborted() {
                return Err(PluginFailure::new("aborted", MinorCode::Aborted));
            }
            ctx.storage_acquired(backend.clone());
            ctx.transfer_progress(TransferDb::Local, TransferDirection::Incoming, backend, 0);
        }

        let mut results = SyncResults::new(
            start,
            tether_core::MajorCode::Success,
            MinorCode::NoError,
        );
        results.end_time = chrono::Utc::now();
        results.target_id = Some("loopback".to_owned());
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tether_core::profile::{Profile, ProfileType, KEY_ENABLED};
    use tether_core::SyncLog;

    struct CollectSink(Mutex<Vec<RunnerEvent>>);

    impl ProgressSink for CollectSink {
        fn emit(&self, event: RunnerEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn context_for(profile: Profile) -> (SessionContext, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let log = SyncLog::new(&profile.name);
        let sync_profile = SyncProfile::new(profile, log).unwrap();
        let ctx = SessionContext::new(
            sync_profile,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            sink.clone(),
        );
        (ctx, sink)
    }

    #[test]
    fn loopback_succeeds_and_reports_storages() {
        let mut profile = Profile::new("p", ProfileType::Sync);
        let mut contacts = Profile::new("contacts", ProfileType::Storage);
        contacts.set_key(KEY_ENABLED, "true");
        profile.sub_profiles.push(contacts);

        let (ctx, sink) = context_for(profile);
        let results = LoopbackPlugin.sync(&ctx).unwrap();
        assert!(results.is_success());
        assert_eq!(results.target_id.as_deref(), Some("loopback"));

        let events = sink.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RunnerEvent::StorageAcquired { mime } if mime == "contacts")));
    }

    #[test]
    fn registry_creates_registered_plugins() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.contains("loopback"));
        assert!(registry.create("loopback").is_some());
        assert!(registry.create("missing").is_none());
    }

    #[test]
    fn context_flags_reflect_session_requests() {
        let abort = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let profile = Profile::new("p", ProfileType::Sync);
        let sync_profile = SyncProfile::new(profile, SyncLog::new("p")).unwrap();
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let ctx = SessionContext::new(sync_profile, abort.clone(), stop.clone(), sink);

        assert!(!ctx.aborted());
        abort.store(true, Ordering::SeqCst);
        assert!(ctx.aborted());
        stop.store(true, Ordering::SeqCst);
        assert!(ctx.stop_requested());
    }
}
