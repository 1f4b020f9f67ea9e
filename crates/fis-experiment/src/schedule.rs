//! Cron schedules for recurring experiments

use chrono::{DateTime, Duration, Utc};
use croner::Cron;

use fis_common::Error;

/// Missed slots walked before the search jumps close to `now`
const MAX_SLOTS_WALKED: usize = 10_000;

/// A parsed 5-field cron expression, evaluated in UTC
#[derive(Clone, Debug)]
pub struct CronSchedule {
    cron: Cron,
}

/// A slot that is due to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Due {
    /// The most recent slot at or before `now`
    pub at: DateTime<Utc>,
    /// Slots between the anchor and `at` that were skipped
    pub missed: usize,
}

impl CronSchedule {
    /// Parse a standard 5-field expression (minute hour day-of-month month day-of-week)
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let expression = expression.trim();
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| Error::validation(format!("invalid schedule '{}': {}", expression, e)))?;
        Ok(Self { cron })
    }

    /// First slot strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }

    /// Latest slot after `anchor` that is not after `now`.
    ///
    /// Several missed slots collapse into one run of the most recent.
    pub fn next_due(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<Due> {
        let mut cursor = anchor;
        let mut due: Option<DateTime<Utc>> = None;
        let mut walked = 0usize;
        let mut skipped = 0usize;

        while let Some(slot) = self.next_after(cursor) {
            if slot > now {
                break;
            }
            if due.is_some() {
                skipped += 1;
            }
            due = Some(slot);
            cursor = slot;
            walked += 1;

            // a frequent schedule far behind: skip ahead instead of walking every slot
            if walked == MAX_SLOTS_WALKED {
                let jump = now - Duration::days(1);
                if jump > cursor {
                    cursor = jump;
                }
            }
        }

        due.map(|at| Due { at, missed: skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(CronSchedule::parse("not a cron").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
    }

    #[test]
    fn test_next_after_is_strict() {
        let every_minute = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(every_minute.next_after(at(10, 0, 0)), Some(at(10, 1, 0)));
        assert_eq!(every_minute.next_after(at(10, 0, 30)), Some(at(10, 1, 0)));
    }

    #[test]
    fn test_nothing_due_before_first_slot() {
        let hourly = CronSchedule::parse("0 * * * *").unwrap();
        assert_eq!(hourly.next_due(at(10, 0, 0), at(10, 59, 59)), None);
    }

    #[test]
    fn test_missed_slots_collapse_to_latest() {
        let every_minute = CronSchedule::parse("* * * * *").unwrap();
        let due = every_minute.next_due(at(10, 0, 0), at(10, 5, 30)).unwrap();
        assert_eq!(due.at, at(10, 5, 0));
        assert_eq!(due.missed, 4);
    }

    #[test]
    fn test_slot_equal_to_now_is_due() {
        let hourly = CronSchedule::parse("0 * * * *").unwrap();
        let due = hourly.next_due(at(10, 0, 0), at(11, 0, 0)).unwrap();
        assert_eq!(due.at, at(11, 0, 0));
        assert_eq!(due.missed, 0);
    }

    #[test]
    fn test_far_behind_schedule_still_finds_latest_slot() {
        let every_minute = CronSchedule::parse("* * * * *").unwrap();
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).unwrap();
        let due = every_minute.next_due(anchor, now).unwrap();
        assert_eq!(due.at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 0).unwrap());
    }

    #[test]
    fn test_day_of_week_sunday_is_zero() {
        let sundays = CronSchedule::parse("0 3 * * 0").unwrap();
        // 2024-05-01 is a Wednesday
        let next = sundays.next_after(at(0, 0, 0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 5, 3, 0, 0).unwrap());
    }
}
