//! Per-profile alarm queue.
//!
//! Keeps at most one pending fire instant per profile; the runtime sleeps
//! until the earliest deadline. Superseded heap entries are invalidated
//! lazily against the authoritative per-profile map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct AlarmQueue {
    deadlines: HashMap<String, DateTime<Utc>>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

impl AlarmQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or move) the profile's alarm.
    pub fn set(&mut self, profile: &str, at: DateTime<Utc>) {
        self.deadlines.insert(profile.to_owned(), at);
        self.heap.push(Reverse((at, profile.to_owned())));
    }

    pub fn remove(&mut self, profile: &str) {
        self.deadlines.remove(profile);
    }

    pub fn is_pending(&self, profile: &str) -> bool {
        self.deadlines.contains_key(profile)
    }

    pub fn deadline(&self, profile: &str) -> Option<DateTime<Utc>> {
        self.deadlines.get(profile).copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.drop_stale_head();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every profile whose alarm is due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        loop {
            self.drop_stale_head();
            let head_due = match self.heap.peek() {
                Some(Reverse((at, _))) => *at <= now,
                None => false,
            };
            if !head_due {
                break;
            }
            if let Some(Reverse((_, profile))) = self.heap.pop() {
                self.deadlines.remove(&profile);
                due.push(profile);
            }
        }
        due
    }

    fn drop_stale_head(&mut self) {
        while let Some(Reverse((at, profile))) = self.heap.peek() {
            if self.deadlines.get(profile) == Some(at) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn pops_due_alarms_in_order() {
        let mut alarms = AlarmQueue::new();
        alarms.set("b", t(10));
        alarms.set("a", t(5));
        alarms.set("c", t(20));

        assert_eq!(alarms.next_deadline(), Some(t(5)));
        assert_eq!(alarms.pop_due(t(12)), vec!["a", "b"]);
        assert_eq!(alarms.len(), 1);
        assert!(alarms.is_pending("c"));
    }

    #[test]
    fn setting_again_supersedes_previous_deadline() {
        let mut alarms = AlarmQueue::new();
        alarms.set("p", t(5));
        alarms.set("p", t(30));

        assert_eq!(alarms.next_deadline(), Some(t(30)));
        assert!(alarms.pop_due(t(10)).is_empty(), "old entry is stale");
        assert_eq!(alarms.pop_due(t(30)), vec!["p"]);
    }

    #[test]
    fn removed_alarms_never_fire() {
        let mut alarms = AlarmQueue::new();
        alarms.set("p", t(5));
        alarms.remove("p");

        assert_eq!(alarms.next_deadline(), None);
        assert!(alarms.pop_due(t(59)).is_empty());
        assert!(alarms.is_empty());
    }

    #[test]
    fn pop_due_consumes_the_alarm() {
        let mut alarms = AlarmQueue::new();
        alarms.set("p", t(5));
        assert_eq!(alarms.pop_due(t(5)), vec!["p"]);
        assert!(alarms.pop_due(t(5) + Duration::hours(1)).is_empty());
    }
}
