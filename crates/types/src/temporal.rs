// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Hour flattening and hour-of-week bucketing
//!
//! All contract bookkeeping is keyed on wall-clock hours in UTC. Bucket 0 of the week is Monday
//! 00:00.

use std::time::Duration;

use chrono::{DateTime, Datelike, DurationRound, TimeDelta, Timelike, Utc};

use crate::constants::HOURS_PER_WEEK;

/// Truncate a time to the start of its hour
#[must_use]
pub fn floor_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    // only fails for times outside the representable timestamp range
    time.duration_trunc(TimeDelta::hours(1)).unwrap_or(time)
}

/// Hour-of-week bucket of a time, always in `[0, 168)`
#[must_use]
pub fn hour_of_week(time: DateTime<Utc>) -> usize {
    let day = time.weekday().num_days_from_monday() as usize;
    (day * 24 + time.hour() as usize) % HOURS_PER_WEEK
}

/// Whole hours from `start` to `end`, negative if `end` is earlier
#[must_use]
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (floor_hour(end) - floor_hour(start)).num_hours()
}

/// Convert a std duration, saturating at the largest representable delta
#[must_use]
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn monday_midnight_is_bucket_zero() {
        // 2024-01-01 was a Monday
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(hour_of_week(monday), 0);

        let sunday_last_hour = Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap();
        assert_eq!(hour_of_week(sunday_last_hour), 167);

        let next_monday = Utc.with_ymd_and_hms(2024, 1, 8, 0, 30, 0).unwrap();
        assert_eq!(hour_of_week(next_monday), 0);
    }

    #[test]
    fn flattening_drops_minutes_and_below() {
        let time = Utc.with_ymd_and_hms(2024, 3, 5, 14, 59, 59).unwrap();
        assert_eq!(
            floor_hour(time),
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap()
        );
        assert_eq!(
            hours_between(time, time + TimeDelta::minutes(1)),
            1,
            "crossing the hour boundary counts as one hour"
        );
    }
}
