//! Responses to the device's wall-clock requests.
//!
//! Devices without a clock ask the host for the time after pairing.  The
//! timezone field is the UTC offset in hours × 100 (`+01:00` → `100`,
//! `-05:30` → `-550`) as a big-endian `i16`.

use chrono::{DateTime, Datelike, Offset, TimeZone, Timelike};

/// Encodes a UTC offset in seconds as the wire timezone field.
pub fn timezone_field(offset_seconds: i32) -> i16 {
    (offset_seconds / 36) as i16
}

/// Payload for a type-1 time request: ASCII epoch milliseconds ++ timezone.
pub fn time1_response<Tz: TimeZone>(now: &DateTime<Tz>) -> Vec<u8> {
    let mut payload = now.timestamp_millis().to_string().into_bytes();
    payload.extend_from_slice(&timezone_field(now.offset().fix().local_minus_utc()).to_be_bytes());
    payload
}

/// Payload for a type-2 time request: broken-down local time ++ timezone.
///
/// Weekday counts from Monday = 0.
pub fn time2_response<Tz: TimeZone>(now: &DateTime<Tz>) -> Vec<u8> {
    let mut payload = vec![
        (now.year().rem_euclid(100)) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        now.weekday().num_days_from_monday() as u8,
    ];
    payload.extend_from_slice(&timezone_field(now.offset().fix().local_minus_utc()).to_be_bytes());
    payload
}
