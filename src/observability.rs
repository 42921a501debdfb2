use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "pawbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "pawbook_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "pawbook_reservations_total";

/// Histogram: reservation latency in seconds, lock wait included.
pub const RESERVE_DURATION_SECONDS: &str = "pawbook_reserve_duration_seconds";

/// Counter: confirmation activities that could not be recorded.
pub const ACTIVITY_EMIT_FAILURES_TOTAL: &str = "pawbook_activity_emit_failures_total";

/// Counter: activities soft-deleted by the retention reaper.
pub const ACTIVITIES_EXPIRED_TOTAL: &str = "pawbook_activities_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "pawbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "pawbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "pawbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pawbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pawbook_wal_flush_batch_size";

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
        Command::InsertSlot { .. } => "insert_slot",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertActivity { .. } => "insert_activity",
        Command::SelectActivities { .. } => "select_activities",
    }
}
