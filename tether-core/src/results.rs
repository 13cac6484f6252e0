//! Sync outcome taxonomy and the per-profile result log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most recent results kept per profile.
pub const MAX_LOG_ENTRIES: usize = 5;

// ---------------------------------------------------------------------------
// Codes
// ---------------------------------------------------------------------------

/// Major outcome of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MajorCode {
    Success,
    Failed,
    Cancelled,
}

/// Fine-grained error taxonomy carried alongside the major outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinorCode {
    NoError,
    InternalError,
    ConnectionError,
    Aborted,
    PluginError,
    UnsupportedSyncType,
}

/// Outer status reported to IPC clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Queued,
    Started,
    Progress,
    Error,
    Done,
    Aborted,
    NotPossible,
}

impl SyncStatus {
    /// Terminal statuses end a session; the rest are progress notifications.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::Error | SyncStatus::Done | SyncStatus::Aborted | SyncStatus::NotPossible
        )
    }
}

macro_rules! string_enum {
    ($ty:ty { $($variant:path => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $($variant => $name,)+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    )),
                }
            }
        }
    };
}

string_enum!(MajorCode {
    MajorCode::Success => "success",
    MajorCode::Failed => "failed",
    MajorCode::Cancelled => "cancelled",
});

string_enum!(MinorCode {
    MinorCode::NoError => "no_error",
    MinorCode::InternalError => "internal_error",
    MinorCode::ConnectionError => "connection_error",
    MinorCode::Aborted => "aborted",
    MinorCode::PluginError => "plugin_error",
    MinorCode::UnsupportedSyncType => "unsupported_sync_type",
});

string_enum!(SyncStatus {
    SyncStatus::Queued => "queued",
    SyncStatus::Started => "started",
    SyncStatus::Progress => "progress",
    SyncStatus::Error => "error",
    SyncStatus::Done => "done",
    SyncStatus::Aborted => "aborted",
    SyncStatus::NotPossible => "not_possible",
});

// ---------------------------------------------------------------------------
// SyncResults
// ---------------------------------------------------------------------------

/// Outcome snapshot of a single sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResults {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub major: MajorCode,
    pub minor: MinorCode,
    /// Identifier of the remote peer, as reported by the plugin.
    pub target_id: Option<String>,
    /// Whether the run was fired by the scheduler.
    pub scheduled: bool,
}

impl SyncResults {
    pub fn new(start_time: DateTime<Utc>, major: MajorCode, minor: MinorCode) -> Self {
        Self {
            start_time,
            end_time: start_time,
            major,
            minor,
            target_id: None,
            scheduled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.major == MajorCode::Success
    }
}

// ---------------------------------------------------------------------------
// SyncLog
// ---------------------------------------------------------------------------

/// Append-only sequence of [`SyncResults`] for one profile, most recent
/// last, capped at [`MAX_LOG_ENTRIES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLog {
    pub profile_name: String,
    entries: Vec<SyncResults>,
}

impl SyncLog {
    pub fn new(profile_name: impl Into<String>) -> Self {
        Self {
            profile_name: profile_name.into(),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[SyncResults] {
        &self.entries
    }

    pub fn add_results(&mut self, results: SyncResults) {
        self.entries.push(results);
        if self.entries.len() > MAX_LOG_ENTRIES {
            let excess = self.entries.len() - MAX_LOG_ENTRIES;
            self.entries.drain(..excess);
        }
    }

    pub fn last_results(&self) -> Option<&SyncResults> {
        self.entries.last()
    }

    pub fn last_successful_sync_time(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .find(|r| r.is_success())
            .map(|r| r.end_time)
    }

    pub(crate) fn from_entries(profile_name: String, entries: Vec<SyncResults>) -> Self {
        Self {
            profile_name,
            entries,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
