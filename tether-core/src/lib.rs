//! tether core library — profile model, persistence, and result log.
//!
//! Public API surface:
//! - [`profile`] — [`Profile`], [`SyncProfile`] and the profile type enums
//! - [`schedule`] — [`SyncSchedule`] recurrence model
//! - [`results`] — outcome taxonomy, [`SyncResults`], [`SyncLog`]
//! - [`store`] — [`ProfileStore`]: overlay, crash-safe saves, expansion
//! - [`criteria`] — conjunctive profile search
//! - [`xml`] — the stable on-disk document form

pub mod criteria;
pub mod error;
pub mod profile;
pub mod results;
pub mod schedule;
pub mod store;
pub mod xml;

pub use criteria::{CriteriaKind, SearchCriteria};
pub use error::ProfileError;
pub use profile::{DestinationType, Profile, ProfileType, SyncProfile, SyncType, Transport};
pub use results::{MajorCode, MinorCode, SyncLog, SyncResults, SyncStatus};
pub use schedule::SyncSchedule;
pub use store::{Paths, ProfileChange, ProfileChangeKind, ProfileStore};
