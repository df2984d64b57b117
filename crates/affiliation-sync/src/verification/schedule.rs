use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeDelta, Utc, Weekday};

/// A weekly wall-clock slot in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    weekday: Weekday,
    time: NaiveTime,
    offset: FixedOffset,
}

impl WeeklySchedule {
    /// Returns `None` when `hour`/`minute` are out of range.
    pub fn new(weekday: Weekday, hour: u32, minute: u32, offset: FixedOffset) -> Option<Self> {
        Some(Self {
            weekday,
            time: NaiveTime::from_hms_opt(hour, minute, 0)?,
            offset,
        })
    }

    /// First slot strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        let local = now.with_timezone(&self.offset).naive_local();
        let today = local.date();
        let days_ahead = (7 + i64::from(self.weekday.num_days_from_monday())
            - i64::from(today.weekday().num_days_from_monday()))
            % 7;

        let mut candidate = (today + TimeDelta::days(days_ahead)).and_time(self.time);
        if candidate <= local {
            candidate += TimeDelta::days(7);
        }

        let utc = candidate - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, self.offset)
    }

    /// Time to sleep from `now` until the next slot.
    pub fn until_next(&self, now: DateTime<Utc>) -> Duration {
        (self.next_after(now).with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
