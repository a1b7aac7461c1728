//! Conversions between absolute `Ms` timestamps and the UTC calendar.
//!
//! Wall-clock time at a facility is UTC. Times of day are carried as
//! fixed-width `HH:MM:SS` strings so pricing lookups can compare them
//! lexically.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};

use crate::model::{DayType, Ms};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_KEY_FORMAT: &str = "%H:%M:%S";
pub const SLOT_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    BadTimeOfDay(String),
    BadDate(String),
    BadTimestamp(String),
    OutOfRange,
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::BadTimeOfDay(s) => write!(f, "invalid time of day: {s} (expected HH:MM or HH:MM:SS)"),
            CalendarError::BadDate(s) => write!(f, "invalid date: {s} (expected YYYY-MM-DD)"),
            CalendarError::BadTimestamp(s) => write!(f, "invalid timestamp: {s} (expected RFC 3339)"),
            CalendarError::OutOfRange => write!(f, "timestamp out of range"),
        }
    }
}

impl std::error::Error for CalendarError {}

pub fn day_type_of(date: NaiveDate) -> DayType {
    match date.weekday() {
        Weekday::Sat | Weekday::Sun => DayType::Weekend,
        _ => DayType::Weekday,
    }
}

/// Day type of the UTC date containing `t`.
pub fn day_type_at(t: Ms) -> Result<DayType, CalendarError> {
    Ok(day_type_of(to_datetime(t)?.date()))
}

/// Accepts `HH:MM:SS` or `HH:MM`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, CalendarError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, TIME_KEY_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, SLOT_FORMAT))
        .map_err(|_| CalendarError::BadTimeOfDay(s.to_string()))
}

/// Normalise a time of day to the zero-padded `HH:MM:SS` key used for storage.
pub fn normalize_time_of_day(s: &str) -> Result<String, CalendarError> {
    Ok(time_key(parse_time_of_day(s)?))
}

pub fn time_key(t: NaiveTime) -> String {
    t.format(TIME_KEY_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|_| CalendarError::BadDate(s.to_string()))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

/// RFC 3339 with any offset, normalised to UTC milliseconds.
pub fn parse_rfc3339(s: &str) -> Result<Ms, CalendarError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| CalendarError::BadTimestamp(s.to_string()))
}

pub fn format_rfc3339(t: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(t) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => t.to_string(),
    }
}

pub fn to_datetime(t: Ms) -> Result<NaiveDateTime, CalendarError> {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.naive_utc())
        .ok_or(CalendarError::OutOfRange)
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

/// Midnight UTC at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> Ms {
    to_ms(date.and_time(NaiveTime::MIN))
}

/// `HH:MM:SS` time-of-day key of the instant `t`.
pub fn time_key_at(t: Ms) -> Result<String, CalendarError> {
    Ok(time_key(to_datetime(t)?.time()))
}

pub fn today(now: Ms) -> Result<NaiveDate, CalendarError> {
    Ok(to_datetime(now)?.date())
}

/// Inclusive ascending iteration over `[start, end]`.
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start
        .iter_days()
        .take_while(move |d| *d <= end)
}

pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    date.checked_add_signed(Duration::days(days)).unwrap_or(NaiveDate::MAX)
}
