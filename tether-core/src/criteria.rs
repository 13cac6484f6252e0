//! Conjunctive profile search filters.
//!
//! A [`SearchCriteria`] selects a profile (the root, a named sub-profile, or
//! any sub-profile of a type) and tests a key on it. A profile matches a
//! criteria list when every criterion matches.

use crate::profile::{Profile, ProfileType};

/// How a criterion tests its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaKind {
    Equal,
    NotEqual,
    Exists,
    NotExists,
}

/// One conjunct of a profile search.
#[derive(Debug, Clone)]
pub struct SearchCriteria {
    pub kind: CriteriaKind,
    /// Select the uniquely named sub-profile (of `sub_type`, when given).
    pub sub_name: Option<String>,
    /// With no `sub_name`, any sub-profile of this type may satisfy the
    /// criterion.
    pub sub_type: Option<ProfileType>,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl SearchCriteria {
    pub fn new(kind: CriteriaKind) -> Self {
        Self {
            kind,
            sub_name: None,
            sub_type: None,
            key: None,
            value: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn sub_name(mut self, name: impl Into<String>) -> Self {
        self.sub_name = Some(name.into());
        self
    }

    pub fn sub_type(mut self, sub_type: ProfileType) -> Self {
        self.sub_type = Some(sub_type);
        self
    }
}

/// Whether `profile` satisfies every criterion.
pub fn matches(profile: &Profile, criteria: &[SearchCriteria]) -> bool {
    criteria.iter().all(|c| match_one(profile, c))
}

fn match_one(profile: &Profile, criteria: &SearchCriteria) -> bool {
    match (&criteria.sub_name, criteria.sub_type) {
        (Some(sub_name), _) => match profile.sub_profile(sub_name, criteria.sub_type) {
            Some(sub) => match_key(sub, criteria),
            // A missing sub-profile satisfies only NOT_EXISTS.
            None => criteria.kind == CriteriaKind::NotExists,
        },
        (None, Some(sub_type)) => {
            let mut subs = profile.sub_profiles_of(sub_type).peekable();
            if subs.peek().is_none() {
                return criteria.kind == CriteriaKind::NotExists;
            }
            subs.any(|sub| match_key(sub, criteria))
        }
        (None, None) => match_key(profile, criteria),
    }
}

fn match_key(profile: &Profile, criteria: &SearchCriteria) -> bool {
    let Some(key) = criteria.key.as_deref() else {
        // No key to test: the selected profile's existence decides.
        return criteria.kind != CriteriaKind::NotExists;
    };

    match profile.key(key) {
        // A missing key makes NOT_EXISTS and NOT_EQUAL both true.
        None => matches!(
            criteria.kind,
            CriteriaKind::NotExists | CriteriaKind::NotEqual
        ),
        Some(value) => {
            let expected = criteria.value.as_deref().unwrap_or("");
            match criteria.kind {
                CriteriaKind::Exists => true,
                CriteriaKind::NotExists => false,
                CriteriaKind::Equal => value == expected,
                CriteriaKind::NotEqual => value != expected,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn profile() -> Profile {
        let mut root = Profile::new("root", ProfileType::Sync);
        root.set_key("x", "1");

        let mut contacts = Profile::new("contacts", ProfileType::Storage);
        contacts.set_key("enabled", "true");
        root.sub_profiles.push(contacts);

        let calendar = Profile::new("calendar", ProfileType::Storage);
        root.sub_profiles.push(calendar);

        root
    }

    #[rstest]
    #[case(CriteriaKind::Equal, "1", true)]
    #[case(CriteriaKind::Equal, "2", false)]
    #[case(CriteriaKind::NotEqual, "2", true)]
    #[case(CriteriaKind::NotEqual, "1", false)]
    fn root_key_comparisons(
        #[case] kind: CriteriaKind,
        #[case] value: &str,
        #[case] expected: bool,
    ) {
        let c = SearchCriteria::new(kind).key("x").value(value);
        assert_eq!(matches(&profile(), &[c]), expected);
    }

    #[test]
    fn missing_key_satisfies_not_exists_and_not_equal() {
        let p = profile();
        let not_exists = SearchCriteria::new(CriteriaKind::NotExists).key("absent");
        let not_equal = SearchCriteria::new(CriteriaKind::NotEqual)
            .key("absent")
            .value("anything");
        let exists = SearchCriteria::new(CriteriaKind::Exists).key("absent");
        assert!(matches(&p, &[not_exists]));
        assert!(matches(&p, &[not_equal]));
        assert!(!matches(&p, &[exists]));
    }

    #[test]
    fn named_sub_profile_selection() {
        let p = profile();
        let hit = SearchCriteria::new(CriteriaKind::Equal)
            .sub_name("contacts")
            .sub_type(ProfileType::Storage)
            .key("enabled")
            .value("true");
        assert!(matches(&p, &[hit]));

        let missing_sub = SearchCriteria::new(CriteriaKind::Equal)
            .sub_name("notes")
            .sub_type(ProfileType::Storage)
            .key("enabled")
            .value("true");
        assert!(!matches(&p, &[missing_sub]));

        let missing_sub_not_exists = SearchCriteria::new(CriteriaKind::NotExists)
            .sub_name("notes")
            .sub_type(ProfileType::Storage);
        assert!(matches(&p, &[missing_sub_not_exists]));
    }

    #[test]
    fn any_sub_profile_of_type_matches() {
        let p = profile();
        // Only "contacts" carries enabled=true; "calendar" does not.
        let c = SearchCriteria::new(CriteriaKind::Equal)
            .sub_type(ProfileType::Storage)
            .key("enabled")
            .value("true");
        assert!(matches(&p, &[c]));

        // No service sub-profiles exist: absence rule applies.
        let absent_type = SearchCriteria::new(CriteriaKind::Equal)
            .sub_type(ProfileType::Service)
            .key("enabled")
            .value("true");
        assert!(!matches(&p, &[absent_type]));
        let absent_type_not_exists =
            SearchCriteria::new(CriteriaKind::NotExists).sub_type(ProfileType::Service);
        assert!(matches(&p, &[absent_type_not_exists]));
    }

    #[test]
    fn conjunction_requires_all() {
        let p = profile();
        let ok = SearchCriteria::new(CriteriaKind::Equal).key("x").value("1");
        let bad = SearchCriteria::new(CriteriaKind::Equal).key("x").value("2");
        assert!(!matches(&p, &[ok.clone(), bad]));
        assert!(matches(&p, &[ok]));
    }

    #[test]
    fn keyless_criterion_tests_presence() {
        let p = profile();
        let exists = SearchCriteria::new(CriteriaKind::Exists)
            .sub_name("contacts")
            .sub_type(ProfileType::Storage);
        assert!(matches(&p, &[exists]));
    }
}
