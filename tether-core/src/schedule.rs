//! Sync recurrence model.
//!
//! A schedule narrows *when* a profile may fire: a set of allowed weekdays,
//! an optional time-of-day window, and a recurring interval. The scheduler
//! treats [`SyncSchedule::next_sync_time`] as an opaque next-fire instant.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};

/// Recurrence settings of a sync profile.
///
/// Weekdays are numbered 1 (Monday) through 7 (Sunday).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncSchedule {
    pub enabled: bool,
    /// Allowed weekdays; empty means every day.
    pub days: BTreeSet<u8>,
    /// Start of the allowed time-of-day window.
    pub start_time: Option<NaiveTime>,
    /// End of the allowed time-of-day window.
    pub end_time: Option<NaiveTime>,
    /// Recurring interval in minutes.
    pub interval_minutes: u32,
}

impl SyncSchedule {
    /// Compute the next fire instant after `reference`.
    ///
    /// Returns `None` when the schedule is disabled or carries no interval.
    /// The candidate `reference + interval` is pushed forward to the next
    /// allowed weekday and into the time window when it falls outside either.
    pub fn next_sync_time(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled || self.interval_minutes == 0 {
            return None;
        }

        let mut candidate = reference + Duration::minutes(i64::from(self.interval_minutes));

        // At most one pass per day of the week is needed to land on an
        // allowed day; the extra iteration absorbs a window rollover.
        for _ in 0..8 {
            if !self.day_allowed(candidate) {
                candidate = self.start_of_next_day(candidate);
                continue;
            }
            match (self.start_time, self.end_time) {
                (Some(start), _) if candidate.time() < start => {
                    candidate = with_time(candidate, start);
                }
                (_, Some(end)) if candidate.time() > end => {
                    candidate = self.start_of_next_day(candidate);
                }
                _ => return Some(candidate),
            }
        }

        // No allowed day found; the days set rejects every weekday.
        None
    }

    fn day_allowed(&self, at: DateTime<Utc>) -> bool {
        self.days.is_empty() || self.days.contains(&(at.weekday().number_from_monday() as u8))
    }

    fn start_of_next_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let day_start = self.start_time.unwrap_or(NaiveTime::MIN);
        with_time(at + Duration::days(1), day_start)
    }
}

fn with_time(at: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    at.date_naive()
        .and_time(time)
        .and_utc()
        .with_nanosecond(0)
        .unwrap_or(at)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(interval: u32) -> SyncSchedule {
        SyncSchedule {
            enabled: true,
            interval_minutes: interval,
            ..SyncSchedule::default()
        }
    }

    // 2024-07-01 is a Monday.
    fn monday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn disabled_schedule_never_fires() {
        let mut s = schedule(30);
        s.enabled = false;
        assert_eq!(s.next_sync_time(monday_noon()), None);
    }

    #[test]
    fn zero_interval_never_fires() {
        assert_eq!(schedule(0).next_sync_time(monday_noon()), None);
    }

    #[test]
    fn plain_interval_adds_minutes() {
        let next = schedule(30).next_sync_time(monday_noon()).unwrap();
        assert_eq!(next, monday_noon() + Duration::minutes(30));
    }

    #[test]
    fn disallowed_day_advances_to_next_allowed_day() {
        let mut s = schedule(30);
        s.days = [2u8].into_iter().collect(); // Tuesdays only
        s.start_time = NaiveTime::from_hms_opt(8, 0, 0);

        let next = s.next_sync_time(monday_noon()).unwrap();
        assert_eq!(next.weekday().number_from_monday(), 2);
        assert_eq!(next.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn before_window_moves_to_window_start() {
        let mut s = schedule(30);
        s.start_time = NaiveTime::from_hms_opt(14, 0, 0);
        s.end_time = NaiveTime::from_hms_opt(18, 0, 0);

        let next = s.next_sync_time(monday_noon()).unwrap();
        assert_eq!(next.time(), NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(next.date_naive(), monday_noon().date_naive());
    }

    #[test]
    fn after_window_rolls_to_next_day_start() {
        let mut s = schedule(30);
        s.start_time = NaiveTime::from_hms_opt(8, 0, 0);
        s.end_time = NaiveTime::from_hms_opt(12, 0, 0);

        // Candidate would land at 12:30, past the window's end.
        let next = s.next_sync_time(monday_noon()).unwrap();
        assert_eq!(next.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(
            next.date_naive(),
            monday_noon().date_naive() + Duration::days(1)
        );
    }

    #[test]
    fn impossible_day_set_yields_none() {
        let mut s = schedule(30);
        s.days = [9u8].into_iter().collect();
        assert_eq!(s.next_sync_time(monday_noon()), None);
    }

    #[test]
    fn next_fire_is_deterministic() {
        let s = schedule(45);
        assert_eq!(
            s.next_sync_time(monday_noon()),
            s.next_sync_time(monday_noon())
        );
    }
}
