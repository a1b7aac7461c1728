use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtbook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations committed as pending.
pub const RESERVATIONS_CREATED_TOTAL: &str = "courtbook_reservations_created_total";

/// Counter: reservations moved to cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "courtbook_reservations_cancelled_total";

/// Counter: create requests refused because the slot was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "courtbook_reservation_conflicts_total";

/// Counter: collaborator calls that failed. Labels: kind.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "courtbook_side_effect_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "courtbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::SelectFacilities => "select_facilities",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::InsertPricing { .. } => "insert_pricing",
        Command::DeletePricing { .. } => "delete_pricing",
        Command::SelectPricing { .. } => "select_pricing",
        Command::SelectAvailability { json: false, .. } => "select_availability",
        Command::SelectAvailability { json: true, .. } => "select_availability_json",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::CountPendingReservations { .. } => "count_pending_reservations",
    }
}
