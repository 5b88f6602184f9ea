use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "yard_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "yard_query_duration_seconds";

/// Counter: assignments refused because every bay in the zone was taken.
pub const ZONE_FULL_TOTAL: &str = "yard_zone_full_total";

/// Counter: mutations attempted without office access.
pub const UNAUTHORIZED_TOTAL: &str = "yard_unauthorized_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "yard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "yard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "yard_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "yard_auth_failures_total";

// ── Schedule store ──────────────────────────────────────────────

/// Counter: table fetches. Labels: source (cache, live, error).
pub const STORE_FETCHES_TOTAL: &str = "yard_store_fetches_total";

/// Histogram: remote read + decode duration in seconds.
pub const STORE_READ_DURATION_SECONDS: &str = "yard_store_read_duration_seconds";

/// Counter: commit attempts. Labels: outcome (ok, conflict, error).
pub const STORE_COMMITS_TOTAL: &str = "yard_store_commits_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::SelectBookings { booking_no: None } => "select_bookings",
        Command::SelectBookings { booking_no: Some(_) } => "lookup_booking",
        Command::SelectYard { .. } => "select_yard",
        Command::SelectZones => "select_zones",
        Command::UpsertBookings { .. } => "upsert_bookings",
        Command::ReleaseBooking { .. } => "release_booking",
        Command::AssignBay { .. } => "assign_bay",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_distinguish_lookup_from_listing() {
        assert_eq!(
            command_label(&Command::SelectBookings { booking_no: None }),
            "select_bookings"
        );
        assert_eq!(
            command_label(&Command::SelectBookings {
                booking_no: Some("B1".into())
            }),
            "lookup_booking"
        );
        assert_eq!(
            command_label(&Command::AssignBay {
                booking_no: "B1".into()
            }),
            "assign_bay"
        );
    }
}
