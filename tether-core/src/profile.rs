//! Domain types for tether profiles.
//!
//! A [`Profile`] is a named, typed configuration document: scalar keys plus an
//! ordered list of nested sub-profiles. [`SyncProfile`] wraps an expanded
//! profile of type `sync` together with its result log and exposes the
//! sync-specific accessors the scheduler works with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::results::SyncLog;
use crate::schedule::SyncSchedule;

// ---------------------------------------------------------------------------
// Well-known keys
// ---------------------------------------------------------------------------

pub const KEY_ENABLED: &str = "enabled";
pub const KEY_HIDDEN: &str = "hidden";
pub const KEY_PROTECTED: &str = "protected";
pub const KEY_DESTINATION_TYPE: &str = "destinationtype";
pub const KEY_RETRY_INTERVALS: &str = "retryintervals";
pub const KEY_REMOTE_ID: &str = "remoteid";
pub const KEY_DISPLAY_NAME: &str = "displayname";
pub const KEY_PLUGIN_PATH: &str = "pluginpath";

pub const VALUE_ONLINE: &str = "online";
pub const VALUE_DEVICE: &str = "device";
pub const VALUE_TRUE: &str = "true";
pub const VALUE_FALSE: &str = "false";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The category of a profile document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Sync,
    Service,
    Storage,
    Client,
    Server,
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProfileType::Sync => "sync",
            ProfileType::Service => "service",
            ProfileType::Storage => "storage",
            ProfileType::Client => "client",
            ProfileType::Server => "server",
        };
        f.write_str(s)
    }
}

impl FromStr for ProfileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(ProfileType::Sync),
            "service" => Ok(ProfileType::Service),
            "storage" => Ok(ProfileType::Storage),
            "client" => Ok(ProfileType::Client),
            "server" => Ok(ProfileType::Server),
            other => Err(format!("unknown profile type '{other}'")),
        }
    }
}

/// Where a sync profile sends its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Online,
    Device,
}

/// Whether a sync profile fires on its own schedule or only on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Scheduled,
    Manual,
}

/// A connectivity kind tracked by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Bt,
    Internet,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Usb => "usb",
            Transport::Bt => "bt",
            Transport::Internet => "internet",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// A named, typed configuration entity.
///
/// A profile is *bare* as parsed from a single file; it becomes *expanded*
/// once the store has resolved its sub-profile references
/// ([`crate::store::ProfileStore::expand`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub profile_type: ProfileType,
    /// Scalar configuration, ordered for a stable on-disk form.
    pub keys: BTreeMap<String, String>,
    pub sub_profiles: Vec<Profile>,
    /// Recurrence settings; only meaningful on a root `sync` profile.
    pub schedule: Option<SyncSchedule>,
    /// Expansion marker. Not serialized.
    pub(crate) loaded: bool,
}

impl Profile {
    pub fn new(name: impl Into<String>, profile_type: ProfileType) -> Self {
        Self {
            name: name.into(),
            profile_type,
            keys: BTreeMap::new(),
            sub_profiles: Vec::new(),
            schedule: None,
            loaded: false,
        }
    }

    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(String::as_str)
    }

    pub fn set_key(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(name.into(), value.into());
    }

    /// Read a boolean key; an absent key yields `default`.
    pub fn bool_key(&self, name: &str, default: bool) -> bool {
        match self.key(name) {
            Some(VALUE_TRUE) => true,
            Some(VALUE_FALSE) => false,
            _ => default,
        }
    }

    pub fn set_bool_key(&mut self, name: &str, value: bool) {
        self.set_key(name, if value { VALUE_TRUE } else { VALUE_FALSE });
    }

    /// Profiles are enabled unless explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        self.bool_key(KEY_ENABLED, true)
    }

    pub fn is_hidden(&self) -> bool {
        self.bool_key(KEY_HIDDEN, false)
    }

    pub fn is_protected(&self) -> bool {
        self.bool_key(KEY_PROTECTED, false)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// A profile is usable when it carries a name; the type is statically
    /// present.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn sub_profile(&self, name: &str, profile_type: Option<ProfileType>) -> Option<&Profile> {
        self.sub_profiles
            .iter()
            .find(|p| p.name == name && profile_type.map_or(true, |t| p.profile_type == t))
    }

    pub fn sub_profile_mut(
        &mut self,
        name: &str,
        profile_type: ProfileType,
    ) -> Option<&mut Profile> {
        self.sub_profiles
            .iter_mut()
            .find(|p| p.name == name && p.profile_type == profile_type)
    }

    pub fn sub_profiles_of(&self, profile_type: ProfileType) -> impl Iterator<Item = &Profile> {
        self.sub_profiles
            .iter()
            .filter(move |p| p.profile_type == profile_type)
    }

    /// Total number of sub-profiles in the whole tree. Expansion converges
    /// when this count stops growing across a pass.
    pub fn sub_profile_count(&self) -> usize {
        self.sub_profiles
            .iter()
            .map(|p| 1 + p.sub_profile_count())
            .sum()
    }

    /// `(name, type)` pairs of every sub-profile not yet marked loaded,
    /// anywhere in the tree.
    pub fn unloaded_sub_refs(&self) -> Vec<(String, ProfileType)> {
        let mut refs = Vec::new();
        collect_unloaded(self, &mut refs);
        refs
    }

    /// Mark every sub-profile named `(name, type)` in the tree as loaded.
    pub fn mark_sub_loaded(&mut self, name: &str, profile_type: ProfileType) {
        for sub in &mut self.sub_profiles {
            if sub.name == name && sub.profile_type == profile_type {
                sub.loaded = true;
            }
            sub.mark_sub_loaded(name, profile_type);
        }
    }

    /// Merge another profile into this one.
    ///
    /// This profile's explicit keys win; `other` supplies any keys not set
    /// here. `other`'s sub-profiles are matched by `(name, type)` — existing
    /// ones merge recursively, new ones are appended.
    pub fn merge(&mut self, other: &Profile) {
        for (key, value) in &other.keys {
            self.keys
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if self.schedule.is_none() {
            self.schedule.clone_from(&other.schedule);
        }
        for sub in &other.sub_profiles {
            match self.sub_profile_mut(&sub.name, sub.profile_type) {
                Some(existing) => existing.merge(sub),
                None => self.sub_profiles.push(sub.clone()),
            }
        }
    }
}

fn collect_unloaded(profile: &Profile, out: &mut Vec<(String, ProfileType)>) {
    for sub in &profile.sub_profiles {
        if !sub.loaded {
            out.push((sub.name.clone(), sub.profile_type));
        }
        collect_unloaded(sub, out);
    }
}

// ---------------------------------------------------------------------------
// SyncProfile
// ---------------------------------------------------------------------------

/// An expanded `sync` profile together with its result log.
#[derive(Debug, Clone)]
pub struct SyncProfile {
    profile: Profile,
    log: SyncLog,
}

impl SyncProfile {
    /// Wrap an expanded profile. Returns `None` unless the profile is of
    /// type `sync`.
    pub fn new(profile: Profile, log: SyncLog) -> Option<Self> {
        if profile.profile_type != ProfileType::Sync {
            return None;
        }
        Some(Self { profile, log })
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut SyncLog {
        &mut self.log
    }

    pub fn is_enabled(&self) -> bool {
        self.profile.is_enabled()
    }

    pub fn is_hidden(&self) -> bool {
        self.profile.is_hidden()
    }

    pub fn key(&self, name: &str) -> Option<&str> {
        self.profile.key(name)
    }

    pub fn destination_type(&self) -> Option<DestinationType> {
        match self.profile.key(KEY_DESTINATION_TYPE) {
            Some(VALUE_ONLINE) => Some(DestinationType::Online),
            Some(VALUE_DEVICE) => Some(DestinationType::Device),
            _ => None,
        }
    }

    pub fn schedule(&self) -> Option<&SyncSchedule> {
        self.profile.schedule.as_ref()
    }

    /// Scheduled iff the profile carries an enabled schedule.
    pub fn sync_type(&self) -> SyncType {
        match self.schedule() {
            Some(schedule) if schedule.enabled => SyncType::Scheduled,
            _ => SyncType::Manual,
        }
    }

    /// Remaining retry sequence in minutes, as declared by the profile.
    pub fn retry_intervals(&self) -> Vec<u32> {
        self.profile
            .key(KEY_RETRY_INTERVALS)
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse::<u32>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The client sub-profile names the plugin that executes the sync.
    pub fn client_profile(&self) -> Option<&Profile> {
        self.profile.sub_profiles_of(ProfileType::Client).next()
    }

    /// Names of the enabled storage backends this profile syncs.
    pub fn storage_backend_names(&self) -> Vec<String> {
        self.profile
            .sub_profiles_of(ProfileType::Storage)
            .filter(|p| p.is_enabled())
            .map(|p| p.name.clone())
            .collect()
    }

    /// The transport this profile needs before a scheduled run is viable:
    /// a `bt` sub-profile pins Bluetooth, an online destination needs the
    /// internet, anything else is a tethered USB peer.
    pub fn required_transport(&self) -> Transport {
        if self.profile.sub_profile("bt", None).is_some() {
            Transport::Bt
        } else if self.destination_type() == Some(DestinationType::Online) {
            Transport::Internet
        } else {
            Transport::Usb
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
