use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "carebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "carebook_query_duration_seconds";

/// Counter: booking requests by outcome. Labels: outcome.
pub const BOOKING_REQUESTS_TOTAL: &str = "carebook_booking_requests_total";

/// Counter: rate-limit decisions. Labels: category, decision
/// (allowed, rejected, fail_open, fail_closed).
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "carebook_rate_limit_decisions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "carebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "carebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "carebook_connections_rejected_total";

/// Gauge: registered caregivers.
pub const CAREGIVERS_REGISTERED: &str = "carebook_caregivers_registered";

/// Counter: statements refused because the user name maps to no actor.
pub const AUTH_FAILURES_TOTAL: &str = "carebook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carebook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertCaregiver { .. } => "upsert_caregiver",
        Command::SetAvailability { .. } => "set_availability",
        Command::ClearAvailability { .. } => "clear_availability",
        Command::PurgeAvailability { .. } => "purge_availability",
        Command::RequestBooking { .. } => "request_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectDaySlots { .. } => "select_day_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectBookingCheck { .. } => "select_booking_check",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectMatches { .. } => "select_matches",
        Command::SelectCancellationQuote { .. } => "select_cancellation_quote",
        Command::SelectRateLimit { .. } => "select_rate_limit",
    }
}
