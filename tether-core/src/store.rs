//! Profile persistence: overlay resolution, crash-safe saves, expansion.
//!
//! **Layout** (both roots configurable through [`Paths`]):
//!
//! ```text
//! <primary>/<type>/<name>.xml        user-writable profiles
//! <primary>/<type>/<name>.xml.bak    transient backup during save
//! <primary>/sync/logs/<name>.log.xml per-profile sync log
//! <secondary>/<type>/<name>.xml      read-only system defaults
//! ```
//!
//! Saves copy the existing file to `.bak` before writing, so at every
//! instant at least one valid document is on disk; `load` reconciles a
//! leftover backup before parsing.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::criteria::{self, SearchCriteria};
use crate::error::{io_err, ProfileError};
use crate::profile::{Profile, ProfileType, SyncProfile};
use crate::results::{SyncLog, SyncResults};
use crate::xml;

const FORMAT_EXT: &str = ".xml";
const BACKUP_EXT: &str = ".bak";
const LOG_SUFFIX: &str = ".log.xml";
const LOG_DIR: &str = "logs";

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// The two profile roots: user-writable primary, read-only secondary.
#[derive(Debug, Clone)]
pub struct Paths {
    pub primary: PathBuf,
    pub secondary: PathBuf,
}

impl Paths {
    pub fn new(primary: impl Into<PathBuf>, secondary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }

    /// `<data_dir>/system/privileged/msyncd` over `/etc/buteo/profiles`.
    pub fn system_default() -> Self {
        let data = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            primary: data.join("system").join("privileged").join("msyncd"),
            secondary: PathBuf::from("/etc/buteo/profiles"),
        }
    }
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// What a store mutation did; forwarded onto the daemon's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileChangeKind {
    Added,
    Modified,
    Removed,
    LogsModified,
}

/// Record of one successful store mutation.
#[derive(Debug, Clone)]
pub struct ProfileChange {
    pub name: String,
    pub kind: ProfileChangeKind,
    /// Serialized document after the change; empty for removals.
    pub serialized: String,
}

// ---------------------------------------------------------------------------
// ProfileStore
// ---------------------------------------------------------------------------

/// Versioned, hierarchical profile storage with a two-tier overlay.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    paths: Paths,
}

impl ProfileStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn primary_path(&self, name: &str, profile_type: ProfileType) -> PathBuf {
        self.paths
            .primary
            .join(profile_type.to_string())
            .join(format!("{name}{FORMAT_EXT}"))
    }

    fn secondary_path(&self, name: &str, profile_type: ProfileType) -> PathBuf {
        self.paths
            .secondary
            .join(profile_type.to_string())
            .join(format!("{name}{FORMAT_EXT}"))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.paths
            .primary
            .join(ProfileType::Sync.to_string())
            .join(LOG_DIR)
            .join(format!("{name}{LOG_SUFFIX}"))
    }

    /// Overlay resolution: primary wins; a missing pair resolves to the
    /// (nominal) primary path.
    fn find_profile_file(&self, name: &str, profile_type: ProfileType) -> PathBuf {
        let primary = self.primary_path(name, profile_type);
        if primary.exists() {
            return primary;
        }
        let secondary = self.secondary_path(name, profile_type);
        if secondary.exists() {
            secondary
        } else {
            primary
        }
    }

    // -- load ---------------------------------------------------------------

    /// Load a bare profile from persistent storage.
    ///
    /// Reconciles a leftover `.bak` sibling before parsing; returns `None`
    /// when no parseable document exists.
    pub fn load(&self, name: &str, profile_type: ProfileType) -> Option<Profile> {
        let path = self.find_profile_file(name, profile_type);
        let backup = backup_path(&path);

        restore_backup_if_found(&path, &backup);

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(profile = name, "profile file not found");
                return None;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read profile file");
                return None;
            }
        };

        match xml::parse_profile(&contents) {
            Ok(profile) => {
                if backup.exists() {
                    let _ = fs::remove_file(&backup);
                }
                Some(profile)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to parse profile");
                None
            }
        }
    }

    /// Load, expand, and attach the log of a sync profile.
    pub fn sync_profile(&self, name: &str) -> Option<SyncProfile> {
        let mut profile = self.load(name, ProfileType::Sync)?;
        if profile.profile_type != ProfileType::Sync {
            tracing::debug!(
                profile = name,
                found = %profile.profile_type,
                "profile exists but is not a sync profile",
            );
            return None;
        }
        self.expand(&mut profile);
        let log = self
            .load_log(name)
            .unwrap_or_else(|| SyncLog::new(name.to_owned()));
        SyncProfile::new(profile, log)
    }

    /// Union of profile names in both roots; primary wins on collision.
    pub fn list(&self, profile_type: ProfileType) -> Vec<String> {
        let mut names = list_dir(&self.paths.primary.join(profile_type.to_string()));
        for name in list_dir(&self.paths.secondary.join(profile_type.to_string())) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn all_sync_profiles(&self) -> Vec<SyncProfile> {
        self.list(ProfileType::Sync)
            .iter()
            .filter_map(|name| self.sync_profile(name))
            .collect()
    }

    pub fn visible_sync_profiles(&self) -> Vec<SyncProfile> {
        self.all_sync_profiles()
            .into_iter()
            .filter(|p| !p.is_hidden())
            .collect()
    }

    /// All expanded sync profiles passing the conjunctive criteria filter.
    pub fn profiles_by_criteria(&self, criteria: &[SearchCriteria]) -> Vec<SyncProfile> {
        self.all_sync_profiles()
            .into_iter()
            .filter(|p| criteria::matches(p.profile(), criteria))
            .collect()
    }

    // -- expansion ----------------------------------------------------------

    /// Resolve and merge every sub-profile reference into `profile`.
    ///
    /// Iterates until a pass neither finds unresolved references nor grows
    /// the sub-profile count; an explicit visited set keeps cyclic reference
    /// graphs from re-loading the same file.
    pub fn expand(&self, profile: &mut Profile) {
        if profile.is_loaded() {
            return;
        }

        let mut visited: BTreeSet<(String, ProfileType)> = BTreeSet::new();
        loop {
            let pending: Vec<(String, ProfileType)> = profile
                .unloaded_sub_refs()
                .into_iter()
                .filter(|r| !visited.contains(r))
                .collect();
            if pending.is_empty() {
                break;
            }

            let count_before = profile.sub_profile_count();
            for (name, sub_type) in pending {
                visited.insert((name.clone(), sub_type));
                match self.load(&name, sub_type) {
                    Some(sub) => profile.merge(&sub),
                    None => tracing::debug!(
                        sub = %name,
                        parent = %profile.name,
                        "referenced sub-profile has no backing file",
                    ),
                }
                profile.mark_sub_loaded(&name, sub_type);
            }

            if profile.sub_profile_count() == count_before {
                break;
            }
        }

        profile.set_loaded(true);
    }

    // -- save ---------------------------------------------------------------

    /// Render and write a profile with backup rollback protection.
    pub fn save(&self, profile: &Profile) -> Result<(), ProfileError> {
        let doc = xml::write_profile(profile)?;
        self.save_rendered(profile, &doc)
    }

    fn save_rendered(&self, profile: &Profile, doc: &str) -> Result<(), ProfileError> {
        let dir = self.paths.primary.join(profile.profile_type.to_string());
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let target = self.primary_path(&profile.name, profile.profile_type);
        let backup = backup_path(&target);

        let existing = self.find_profile_file(&profile.name, profile.profile_type);
        if existing.exists() {
            if let Err(err) = fs::copy(&existing, &backup) {
                tracing::warn!(
                    path = %existing.display(),
                    error = %err,
                    "failed to create profile backup",
                );
            }
        }

        // A crash between here and the write's completion is recovered on
        // the next load from the backup.
        fs::write(&target, doc).map_err(|e| io_err(&target, e))?;

        if backup.exists() {
            let _ = fs::remove_file(&backup);
        }
        Ok(())
    }

    /// Create or overwrite a profile; reports whether it was added or
    /// modified.
    pub fn update_profile(&self, profile: &Profile) -> Result<ProfileChange, ProfileError> {
        if !profile.is_valid() {
            return Err(ProfileError::InvalidProfile(
                "profile is missing a name".to_owned(),
            ));
        }

        let existed = self
            .primary_path(&profile.name, profile.profile_type)
            .exists();
        let doc = xml::write_profile(profile)?;
        self.save_rendered(profile, &doc)?;

        Ok(ProfileChange {
            name: profile.name.clone(),
            kind: if existed {
                ProfileChangeKind::Modified
            } else {
                ProfileChangeKind::Added
            },
            serialized: doc,
        })
    }

    // -- remove / rename ----------------------------------------------------

    /// Delete a profile and its log. Refused for protected profiles.
    pub fn remove(
        &self,
        name: &str,
        profile_type: ProfileType,
    ) -> Result<ProfileChange, ProfileError> {
        let Some(profile) = self.load(name, profile_type) else {
            return Err(ProfileError::NotFound {
                name: name.to_owned(),
            });
        };
        if profile.is_protected() {
            tracing::debug!(profile = name, "cannot remove protected profile");
            return Err(ProfileError::Protected {
                name: name.to_owned(),
            });
        }

        let path = self.primary_path(name, profile_type);
        fs::remove_file(&path).map_err(|e| io_err(&path, e))?;

        // A profile that never synced has no log.
        let log = self.log_path(name);
        if let Err(err) = fs::remove_file(&log) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %log.display(), error = %err, "failed to remove sync log");
            }
        }

        Ok(ProfileChange {
            name: name.to_owned(),
            kind: ProfileChangeKind::Removed,
            serialized: String::new(),
        })
    }

    /// Rename a sync profile and its log together; the profile rename is
    /// rolled back if the log cannot follow.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), ProfileError> {
        let source = self.primary_path(old, ProfileType::Sync);
        let dest = self.primary_path(new, ProfileType::Sync);
        fs::rename(&source, &dest).map_err(|e| io_err(&source, e))?;

        let source_log = self.log_path(old);
        if source_log.exists() {
            let dest_log = self.log_path(new);
            if let Err(err) = fs::rename(&source_log, &dest_log) {
                let _ = fs::rename(&dest, &source);
                return Err(io_err(&source_log, err));
            }
        }
        Ok(())
    }

    // -- logs ---------------------------------------------------------------

    pub fn load_log(&self, name: &str) -> Option<SyncLog> {
        let path = self.log_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read sync log");
                return None;
            }
        };
        match xml::parse_log(&contents) {
            Ok(log) => Some(log),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to parse sync log");
                None
            }
        }
    }

    /// Write a log atomically (tmp + rename), creating directories on
    /// demand.
    pub fn save_log(&self, log: &SyncLog) -> Result<(), ProfileError> {
        let doc = xml::write_log(log)?;
        self.save_rendered_log(&log.profile_name, &doc)
    }

    fn save_rendered_log(&self, name: &str, doc: &str) -> Result<(), ProfileError> {
        let path = self.log_path(name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&tmp, doc).map_err(|e| io_err(&tmp, e))?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }
        Ok(())
    }

    /// Append a run's results to the profile's log and persist it.
    pub fn save_results(
        &self,
        name: &str,
        results: SyncResults,
    ) -> Result<ProfileChange, ProfileError> {
        let mut log = self
            .load_log(name)
            .unwrap_or_else(|| SyncLog::new(name.to_owned()));
        log.add_results(results);
        let doc = xml::write_log(&log)?;
        self.save_rendered_log(name, &doc)?;
        Ok(ProfileChange {
            name: name.to_owned(),
            kind: ProfileChangeKind::LogsModified,
            serialized: doc,
        })
    }

    /// Parse a profile from a serialized document (the IPC update path).
    pub fn profile_from_xml(document: &str) -> Option<Profile> {
        match xml::parse_profile(document) {
            Ok(profile) => Some(profile),
            Err(err) => {
                tracing::warn!(error = %err, "cannot parse profile document");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn backup_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), BACKUP_EXT))
}

/// Reconcile a leftover backup: a valid backup replaces the primary file,
/// an invalid one is dropped.
fn restore_backup_if_found(path: &Path, backup: &Path) {
    if !backup.exists() {
        return;
    }
    tracing::warn!(
        path = %path.display(),
        "profile backup file found; the primary file may be corrupted",
    );

    let valid = fs::read_to_string(backup)
        .ok()
        .and_then(|contents| xml::parse_profile(&contents).ok())
        .is_some();

    if valid {
        tracing::debug!(path = %path.display(), "restoring profile from backup");
        let _ = fs::remove_file(path);
        if let Err(err) = fs::copy(backup, path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to restore backup");
        }
    } else {
        tracing::warn!(path = %backup.display(), "removing unparseable backup file");
        let _ = fs::remove_file(backup);
    }
}

fn list_dir(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("xml")
        })
        .filter_map(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_owned)
        })
        // `.log.xml` and `.xml.bak` siblings never live in the type
        // directories, but stay defensive about stray files.
        .filter(|name| !name.ends_with(".log") && !name.ends_with(".xml"))
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
