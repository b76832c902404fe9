use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatbook_query_duration_seconds";

// ── Server resources ────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "seatbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "seatbook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatbook_connections_rejected_total";

/// Gauge: venues with a loaded engine.
pub const VENUES_ACTIVE: &str = "seatbook_venues_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatbook_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatbook_wal_flush_batch_size";

// ── Reservation flow ────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "seatbook_reservations_created_total";

/// Counter: status changes. Labels: status (the new one).
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "seatbook_reservation_transitions_total";

/// Counter: pending reservations rejected by the listing sweep.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "seatbook_reservations_expired_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpace { .. } => "insert_space",
        Command::InsertChair { .. } => "insert_chair",
        Command::DeactivateResource { .. } => "deactivate_resource",
        Command::InsertUser { .. } => "insert_user",
        Command::DeactivateUser { .. } => "deactivate_user",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::TransitionReservation { decision, .. } => decision.label(),
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectUserReservations { .. } => "select_user_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::InsertCheckIn { .. } => "insert_check_in",
        Command::InsertWalkIn { .. } => "insert_walk_in",
        Command::InsertCheckOut { .. } => "insert_check_out",
        Command::ForceCheckOut { .. } => "force_check_out",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectResources => "select_resources",
    }
}
