//! Exclusive-ownership broker over named storage backends.
//!
//! A profile reserves *all* its backend names atomically or none; callers
//! retry after the holding session terminates rather than blocking.

use std::collections::HashMap;

/// Maps each reserved backend name to the profile holding it.
#[derive(Debug, Default)]
pub struct StorageBooker {
    reservations: HashMap<String, String>,
}

impl StorageBooker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically acquire every backend in `backends` for `profile`.
    ///
    /// Succeeds iff each backend is unowned or already owned by `profile`.
    /// A partial reservation is never visible.
    pub fn reserve(&mut self, backends: &[String], profile: &str) -> bool {
        let free = backends.iter().all(|backend| {
            self.reservations
                .get(backend)
                .map_or(true, |owner| owner == profile)
        });
        if !free {
            return false;
        }
        for backend in backends {
            self.reservations
                .insert(backend.clone(), profile.to_owned());
        }
        true
    }

    /// Release the listed backends. Unknown entries are ignored.
    pub fn release(&mut self, backends: &[String]) {
        for backend in backends {
            self.reservations.remove(backend);
        }
    }

    pub fn is_reserved(&self, backend: &str) -> bool {
        self.reservations.contains_key(backend)
    }

    pub fn holder(&self, backend: &str) -> Option<&str> {
        self.reservations.get(backend).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reserve_grants_all_or_nothing() {
        let mut booker = StorageBooker::new();
        assert!(booker.reserve(&names(&["calendar", "contacts"]), "p1"));

        // p2 wants an overlapping set; nothing of it may be granted.
        assert!(!booker.reserve(&names(&["contacts", "notes"]), "p2"));
        assert!(!booker.is_reserved("notes"), "no partial reservation");
        assert_eq!(booker.holder("contacts"), Some("p1"));
    }

    #[test]
    fn same_profile_can_re_reserve() {
        let mut booker = StorageBooker::new();
        assert!(booker.reserve(&names(&["calendar"]), "p1"));
        assert!(booker.reserve(&names(&["calendar", "contacts"]), "p1"));
    }

    #[test]
    fn release_frees_backends_for_others() {
        let mut booker = StorageBooker::new();
        assert!(booker.reserve(&names(&["contacts"]), "p1"));
        assert!(!booker.reserve(&names(&["contacts"]), "p2"));

        booker.release(&names(&["contacts"]));
        assert!(booker.reserve(&names(&["contacts"]), "p2"));
    }

    #[test]
    fn release_ignores_unknown_backends() {
        let mut booker = StorageBooker::new();
        booker.release(&names(&["ghost"]));
        assert!(!booker.is_reserved("ghost"));
    }

    #[test]
    fn empty_set_reserves_trivially() {
        let mut booker = StorageBooker::new();
        assert!(booker.reserve(&[], "p1"));
    }
}
