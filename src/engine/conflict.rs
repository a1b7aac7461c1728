use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// True if `[start, end)` overlaps any reservation in `reservations`.
///
/// The caller passes only non-cancelled reservations. Both slot marking and
/// the pre-create check go through this predicate so they agree on what is
/// bookable.
pub fn is_occupied<'a>(
    start: Ms,
    end: Ms,
    reservations: impl IntoIterator<Item = &'a Reservation>,
) -> bool {
    first_conflict(start, end, reservations).is_some()
}

/// The first reservation overlapping `[start, end)`, if any.
pub fn first_conflict<'a>(
    start: Ms,
    end: Ms,
    reservations: impl IntoIterator<Item = &'a Reservation>,
) -> Option<&'a Reservation> {
    let query = Span { start, end };
    reservations.into_iter().find(|r| r.span.overlaps(&query))
}

/// Temporal validity of a reservation request, checked in order:
/// end after start, start not in the past, then sanity limits.
pub(crate) fn validate_request(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::Validation("end time must be after start time".into()));
    }
    if start < now {
        return Err(EngineError::Validation("cannot book in the past".into()));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn check_no_conflict(fs: &FacilityState, span: &Span) -> Result<(), EngineError> {
    match first_conflict(span.start, span.end, fs.blocking_overlapping(span)) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
