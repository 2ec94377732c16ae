use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "autobook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "autobook_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "autobook_reservations_created_total";

/// Counter: cancel requests that succeeded (including idempotent repeats).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "autobook_reservations_cancelled_total";

/// Counter: reschedules. Labels: outcome (applied, pending, completed).
pub const RESCHEDULES_TOTAL: &str = "autobook_reschedules_total";

/// Counter: requests rejected because the dates were taken.
pub const DATE_CONFLICTS_TOTAL: &str = "autobook_date_conflicts_total";

/// Counter: gateway calls. Labels: kind (charge, refund), status (ok, failed).
pub const PAYMENTS_TOTAL: &str = "autobook_payments_total";

/// Counter: refunds owed to a customer that the gateway did not settle.
pub const REFUNDS_UNSETTLED_TOTAL: &str = "autobook_refunds_unsettled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "autobook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "autobook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "autobook_connections_rejected_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "autobook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "autobook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "autobook_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "autobook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "autobook_wal_compactions_total";

/// Install the Prometheus exporter on `bind:port`. No-op without a port.
pub fn init(bind: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Short, stable label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCar { .. } => "insert_car",
        Command::UpdateCar { .. } => "update_car",
        Command::DeleteCar { .. } => "delete_car",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::PayReschedule { .. } => "pay_reschedule",
        Command::ConfirmReschedule { .. } => "confirm_reschedule",
        Command::SelectCars => "select_cars",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
