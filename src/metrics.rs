use tracing::trace;

// Lightweight metrics helpers; the Prometheus recorder in main picks up
// whatever the exporter scrapes, these add trace-level breadcrumbs that
// survive even when no recorder is installed (tests).

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "permit.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn lead_processed(lead_id: i64, elapsed_ms: u128) {
    trace!(
        target = "permit.metrics",
        lead_id = lead_id,
        elapsed_ms = elapsed_ms as u64,
        "lead_processed"
    );
}
