use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking requests. Labels: outcome (`granted`, `waitlisted` or an error label).
pub const ALLOCATION_REQUESTS_TOTAL: &str = "slotline_allocation_requests_total";

/// Counter: waitlist entries converted into allocations.
pub const PROMOTIONS_TOTAL: &str = "slotline_promotions_total";

/// Counter: allocations marked no-show. Labels: source (`sweep`, `manual`).
pub const NO_SHOWS_TOTAL: &str = "slotline_no_shows_total";

/// Counter: waiting entries expired because their slot started.
pub const WAITLIST_EXPIRED_TOTAL: &str = "slotline_waitlist_expired_total";

/// Counter: slots created by the generator.
pub const SLOTS_GENERATED_TOTAL: &str = "slotline_slots_generated_total";

/// Counter: unit status changes. Labels: status.
pub const UNIT_STATUS_CHANGES_TOTAL: &str = "slotline_unit_status_changes_total";

// ── Background work ─────────────────────────────────────────────

/// Histogram: expiry sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "slotline_sweep_duration_seconds";

/// Counter: slots a sweep pass failed on.
pub const SWEEP_FAILURES_TOTAL: &str = "slotline_sweep_failures_total";

/// Counter: WAL snapshot rewrites.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotline_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotline_wal_flush_batch_size";

/// Counter: notices published to subscribers. Labels: kind.
pub const NOTICES_TOTAL: &str = "slotline_notices_total";

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
