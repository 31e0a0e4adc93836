//! Time-of-day helpers for daily triggers and daily methods

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Timelike};
use vd_error::{Result, VerdantError};

/// Parse "HH:MM" or "HH:MM:SS"
pub fn parse_time_of_day(text: &str) -> Result<NaiveTime> {
    let trimmed = text.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| VerdantError::invalid_config("time", format!("'{}' is not HH:MM or HH:MM:SS", text)))
}

/// Seconds elapsed since local midnight
pub fn seconds_since_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> f64 {
    now.num_seconds_from_midnight() as f64 + now.nanosecond() as f64 / 1e9
}

/// Next instant strictly after `now` at which the wall clock reads `time`
pub fn next_daily<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        // Ambiguous or skipped local times (DST) resolve to the earliest valid instant
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    now.clone() + ChronoDuration::days(1)
}

/// Whether `now` falls within the daily span `[start, end)`
///
/// Spans whose end is earlier than their start wrap past midnight.
pub fn in_daily_span(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}
