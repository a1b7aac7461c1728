use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::DayType;

#[derive(Debug)]
pub enum EngineError {
    /// Facility has no schedule rows or no pricing rows.
    NotConfigured(Ulid),
    Validation(String),
    /// Requested interval overlaps this existing reservation.
    Conflict(Ulid),
    /// Reservation exists but belongs to another user.
    Unauthorized(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    ScheduleExists(Ulid, DayType),
    HasLiveReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Errors the caller caused and should see verbatim. Everything else is
    /// a server-side failure whose detail stays in the logs.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::NotConfigured(_) | EngineError::WalError(_))
    }
}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotConfigured(id) => {
                write!(f, "facility {id} has no schedule or pricing configured")
            }
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(id) => {
                write!(f, "this time slot is already reserved (conflicts with {id})")
            }
            EngineError::Unauthorized(id) => {
                write!(f, "reservation {id} does not belong to this user")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ScheduleExists(id, day_type) => {
                write!(f, "facility {id} already has a {day_type} schedule")
            }
            EngineError::HasLiveReservations(id) => {
                write!(f, "cannot delete facility {id}: has pending or confirmed reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
