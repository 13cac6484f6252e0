//! tether daemon runtime: transport tracking, storage arbitration, plugin
//! runners, per-profile sync sessions, and the scheduler that drives them.

pub mod alarms;
pub mod booker;
mod error;
pub mod events;
pub mod paths;
pub mod plugin;
pub mod protocol;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use booker::StorageBooker;
pub use error::DaemonError;
pub use plugin::{PluginFailure, PluginRegistry, ProgressSink, SessionContext, SyncPlugin};
pub use protocol::{
    request_abort_sync, request_get_log, request_get_profile, request_list_profiles,
    request_remove_profile, request_start_sync, request_status, request_stop,
    request_update_profile, send_request, send_transport_event, watch_events, DaemonRequest,
    DaemonResponse, WatchEvent,
};
pub use runner::{
    derived_service_name, PluginRunner, ProcessPluginRunner, RunnerEvent, ThreadPluginRunner,
    TransferDb, TransferDirection, WorkerCommand, WorkerReply,
};
pub use runtime::{run, start_blocking, DaemonConfig};
pub use scheduler::{RunnerFactory, Scheduler, RETRYABLE_MINOR_CODES};
pub use session::{SessionFinished, SessionState, StartOutcome, SyncSession};
pub use transport::{NetworkSessionOutcome, TransportEvent, TransportTracker};
