use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only absolute time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Fractional hours covered by the span.
    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    /// Half-open overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Which weekly rule set applies to a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayType::Weekday => "weekday",
            DayType::Weekend => "weekend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "weekday" => Some(DayType::Weekday),
            "weekend" => Some(DayType::Weekend),
            _ => None,
        }
    }
}

impl std::fmt::Display for DayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }

    /// Everything except `cancelled` occupies its interval.
    pub fn blocks(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening hours for one day type. Times are normalised `HH:MM:SS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub day_type: DayType,
    pub open_time: String,
    pub close_time: String,
}

/// Hourly rate for `[start_hour, end_hour)` on one day type.
/// Hours are normalised `HH:MM:SS` and compared lexically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Ulid,
    pub day_type: DayType,
    pub start_hour: String,
    pub end_hour: String,
    pub price_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub facility_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub total_price: f64,
    pub created_at: Ms,
    pub calendar_event_id: Option<String>,
}

/// One bookable hour on a given day. Times are `HH:MM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableSlot {
    pub start_time: String,
    pub end_time: String,
    pub price_per_hour: f64,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayAvailability {
    /// `YYYY-MM-DD`
    pub date: String,
    pub is_open: bool,
    pub slots: Vec<AvailableSlot>,
}

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: Option<String>,
    /// At most one per day type.
    pub schedules: Vec<ScheduleRule>,
    /// Sorted by `(day_type, start_hour)`, insertion order breaks ties.
    pub pricing: Vec<PricingRule>,
    /// All reservations including cancelled ones, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl FacilityState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            schedules: Vec::new(),
            pricing: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.schedules.is_empty() && !self.pricing.is_empty()
    }

    pub fn schedule_for(&self, day_type: DayType) -> Option<&ScheduleRule> {
        self.schedules.iter().find(|s| s.day_type == day_type)
    }

    /// Insert or replace the schedule for `rule.day_type`.
    pub fn set_schedule(&mut self, rule: ScheduleRule) {
        self.schedules.retain(|s| s.day_type != rule.day_type);
        self.schedules.push(rule);
        self.schedules.sort_by_key(|s| s.day_type);
    }

    pub fn remove_schedule(&mut self, day_type: DayType) -> Option<ScheduleRule> {
        let pos = self.schedules.iter().position(|s| s.day_type == day_type)?;
        Some(self.schedules.remove(pos))
    }

    /// Insert maintaining `(day_type, start_hour)` order; equal keys keep insertion order.
    pub fn insert_pricing(&mut self, rule: PricingRule) {
        let pos = self.pricing.partition_point(|p| {
            (p.day_type, p.start_hour.as_str()) <= (rule.day_type, rule.start_hour.as_str())
        });
        self.pricing.insert(pos, rule);
    }

    pub fn remove_pricing(&mut self, id: Ulid) -> Option<PricingRule> {
        let pos = self.pricing.iter().position(|p| p.id == id)?;
        Some(self.pricing.remove(pos))
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Non-cancelled reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn blocking_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start && r.status.blocks())
    }

    pub fn live_reservation_count(&self) -> usize {
        self.reservations
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ReservationStatus::Pending | ReservationStatus::Confirmed
                )
            })
            .count()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        name: Option<String>,
    },
    FacilityDeleted {
        id: Ulid,
    },
    ScheduleSet {
        facility_id: Ulid,
        day_type: DayType,
        open_time: String,
        close_time: String,
    },
    ScheduleRemoved {
        facility_id: Ulid,
        day_type: DayType,
    },
    PricingAdded {
        id: Ulid,
        facility_id: Ulid,
        day_type: DayType,
        start_hour: String,
        end_hour: String,
        price_per_hour: f64,
    },
    PricingRemoved {
        id: Ulid,
        facility_id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        user_id: Ulid,
        facility_id: Ulid,
        span: Span,
        status: ReservationStatus,
        total_price: f64,
        created_at: Ms,
    },
    ReservationStatusChanged {
        id: Ulid,
        facility_id: Ulid,
        status: ReservationStatus,
    },
    CalendarEventLinked {
        id: Ulid,
        facility_id: Ulid,
        event_id: String,
    },
}

impl Event {
    /// The facility a non-create/delete event applies to.
    pub fn facility_id(&self) -> Ulid {
        match self {
            Event::FacilityCreated { id, .. } | Event::FacilityDeleted { id } => *id,
            Event::ScheduleSet { facility_id, .. }
            | Event::ScheduleRemoved { facility_id, .. }
            | Event::PricingAdded { facility_id, .. }
            | Event::PricingRemoved { facility_id, .. }
            | Event::ReservationCreated { facility_id, .. }
            | Event::ReservationStatusChanged { facility_id, .. }
            | Event::CalendarEventLinked { facility_id, .. } => *facility_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub configured: bool,
}
