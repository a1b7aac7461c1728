use crate::model::{DAY_MS, Ms};

pub const MAX_FACILITIES_PER_TENANT: usize = 100_000;
pub const MAX_PRICING_RULES_PER_FACILITY: usize = 256;
pub const MAX_RESERVATIONS_PER_FACILITY: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CALENDAR_EVENT_ID_LEN: usize = 1024;

/// Widest availability query, in days (inclusive range length).
pub const MAX_QUERY_DAYS: i64 = 62;
/// Default availability window when only a start date is supplied.
pub const DEFAULT_QUERY_DAYS: i64 = 7;

pub const MAX_RESERVATION_DURATION_MS: Ms = 7 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
