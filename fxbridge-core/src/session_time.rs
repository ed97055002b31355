//! Broker session time correction.
//!
//! Trading servers report timestamps in their own session timezone (UTC+2,
//! UTC+3 during summer) with a daylight-saving calendar that is fixed per
//! year rather than derived from any host timezone database. The switch
//! days below cover 2001–2050; outside that range the month alone decides.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};

const FIRST_YEAR: i32 = 2001;

/// Day of March after which summer time is in effect, per year since 2001.
const DST_STARTS: [u32; 50] = [
    25, 31, 30, 28, 27, 26, 25, 30, 29, 28, // 2001-2010
    27, 25, 31, 30, 29, 27, 26, 25, 31, 29, // 2011-2020
    28, 27, 26, 31, 30, 29, 28, 26, 25, 31, // 2021-2030
    30, 28, 27, 26, 25, 30, 29, 28, 27, 25, // 2031-2040
    31, 30, 29, 27, 26, 25, 31, 29, 28, 27, // 2041-2050
];

/// Day of October before which summer time is still in effect.
const DST_ENDS: [u32; 50] = [
    28, 27, 26, 31, 30, 29, 28, 26, 25, 31, // 2001-2010
    30, 28, 27, 26, 25, 30, 29, 28, 27, 25, // 2011-2020
    31, 30, 29, 27, 26, 25, 31, 29, 28, 27, // 2021-2030
    26, 31, 30, 29, 28, 26, 25, 31, 30, 28, // 2031-2040
    27, 26, 25, 30, 29, 28, 27, 25, 31, 30, // 2041-2050
];

fn switch_day(table: &[u32; 50], year: i32) -> Option<u32> {
    usize::try_from(year - FIRST_YEAR)
        .ok()
        .and_then(|idx| table.get(idx))
        .copied()
}

/// Whether the session clock is on summer time at the given local instant.
#[must_use]
pub fn is_summer(local: NaiveDateTime) -> bool {
    match local.month() {
        3 => switch_day(&DST_STARTS, local.year()).is_some_and(|day| local.day() > day),
        10 => switch_day(&DST_ENDS, local.year()).is_some_and(|day| local.day() < day),
        4..=9 => true,
        _ => false,
    }
}

/// Convert a broker-local session timestamp to UTC.
#[must_use]
pub fn to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    let offset = if is_summer(local) { 3 } else { 2 };
    Utc.from_utc_datetime(&(local - Duration::hours(offset)))
}

/// Convert a UTC instant back to the broker-local session clock.
#[must_use]
pub fn to_session(utc: DateTime<Utc>) -> NaiveDateTime {
    let winter = utc.naive_utc() + Duration::hours(2);
    if is_summer(winter) {
        utc.naive_utc() + Duration::hours(3)
    } else {
        winter
    }
}
