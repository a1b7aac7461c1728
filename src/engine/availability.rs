use chrono::{NaiveDate, Timelike};

use crate::calendar;
use crate::model::*;

use super::conflict::is_occupied;
use super::pricing::price_for_slot;
use super::EngineError;

const SLOT_MS: Ms = HOUR_MS;

// ── Availability Algorithm ────────────────────────────────────────

/// Day-by-day slot calendar for `[start_date, end_date]` (inclusive).
///
/// Schedules and pricing are weekly rules; a facility missing either set
/// cannot be booked at all and yields `NotConfigured` rather than an empty
/// calendar. A day whose type has no schedule row is a normal closed day.
pub fn build_availability(
    facility: &FacilityState,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<Vec<DayAvailability>, EngineError> {
    if !facility.is_configured() {
        return Err(EngineError::NotConfigured(facility.id));
    }
    if end_date < start_date {
        return Ok(Vec::new());
    }

    // +1 day so reservations ending exactly at the range boundary are seen.
    let window = Span::new(
        calendar::start_of_day(start_date),
        calendar::start_of_day(calendar::add_days(end_date, 1)),
    );
    let booked: Vec<&Reservation> = facility.blocking_overlapping(&window).collect();

    Ok(calendar::days_inclusive(start_date, end_date)
        .map(|date| build_day(facility, date, &booked))
        .collect())
}

fn build_day(facility: &FacilityState, date: NaiveDate, booked: &[&Reservation]) -> DayAvailability {
    let day_type = calendar::day_type_of(date);
    let mut day = DayAvailability {
        date: calendar::format_date(date),
        is_open: false,
        slots: Vec::new(),
    };

    let Some(schedule) = facility.schedule_for(day_type) else {
        return day;
    };
    day.is_open = true;

    let (Ok(open), Ok(close)) = (
        calendar::parse_time_of_day(&schedule.open_time),
        calendar::parse_time_of_day(&schedule.close_time),
    ) else {
        return day;
    };

    let midnight = calendar::start_of_day(date);
    let close_at = midnight + close.num_seconds_from_midnight() as Ms * 1000;
    let mut slot_start = midnight + open.num_seconds_from_midnight() as Ms * 1000;

    // Whole hours only: a remainder shorter than a slot is dropped.
    while slot_start + SLOT_MS <= close_at {
        let slot_end = slot_start + SLOT_MS;
        let offset = slot_start - midnight;
        let key = format_offset(offset, calendar::TIME_KEY_FORMAT);

        day.slots.push(AvailableSlot {
            start_time: format_offset(offset, calendar::SLOT_FORMAT),
            end_time: format_offset(slot_end - midnight, calendar::SLOT_FORMAT),
            price_per_hour: price_for_slot(day_type, &key, &facility.pricing),
            available: !is_occupied(slot_start, slot_end, booked.iter().copied()),
        });
        slot_start = slot_end;
    }

    day
}

/// Format a millisecond offset from midnight as a wall-clock time.
fn format_offset(offset: Ms, fmt: &str) -> String {
    let secs = (offset / 1000).rem_euclid(86_400) as u32;
    chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
        .map(|t| t.format(fmt).to_string())
        .unwrap_or_default()
}
