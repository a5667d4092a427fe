use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "opdtoken_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "opdtoken_query_duration_seconds";

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: tokens booked. Labels: placement (direct, overflow, displaced, redirected).
pub const BOOKINGS_TOTAL: &str = "opdtoken_bookings_total";

/// Counter: booking requests with no committable outcome.
pub const BOOKINGS_REJECTED_TOTAL: &str = "opdtoken_bookings_rejected_total";

/// Counter: tokens pushed out of their slot by a higher-priority booking.
pub const DISPLACEMENTS_TOTAL: &str = "opdtoken_displacements_total";

/// Counter: displaced tokens left without a slot.
pub const STRANDED_TOTAL: &str = "opdtoken_stranded_total";

/// Counter: lifecycle transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "opdtoken_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "opdtoken_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "opdtoken_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "opdtoken_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertToken { .. } => "insert_token",
        Command::InsertEmergencyToken { .. } => "insert_emergency_token",
        Command::DeleteToken { .. } => "delete_token",
        Command::InsertNoShow { .. } => "insert_no_show",
        Command::InsertCompletion { .. } => "insert_completion",
        Command::InsertReassignment { .. } => "insert_reassignment",
        Command::SelectDoctors => "select_doctors",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectToken { .. } => "select_token",
        Command::SelectStrandedTokens => "select_stranded_tokens",
    }
}
