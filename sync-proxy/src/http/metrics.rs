//! Prometheus metrics endpoint.

use crate::server::SyncProxy;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(proxy): Extension<Arc<SyncProxy>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&proxy),
    )
}

fn render(proxy: &SyncProxy) -> String {
    let m = proxy.metrics();

    // Gauges
    let targets = proxy.registry().len();
    let active = proxy.registry().active_count();
    let running = m.running_loops.load(Ordering::Relaxed);

    // Counters
    let syncs = m.syncs.load(Ordering::Relaxed);
    let sync_errors = m.sync_errors.load(Ordering::Relaxed);
    let sync_failures = m.sync_failures.load(Ordering::Relaxed);
    let txns = m.transactions_sent.load(Ordering::Relaxed);
    let notices = m.error_notifications_sent.load(Ordering::Relaxed);
    let retries = m.delivery_retries.load(Ordering::Relaxed);
    let failed = m.deliveries_failed.load(Ordering::Relaxed);

    format!(
        r#"# HELP syncproxy_info Server information
# TYPE syncproxy_info gauge
syncproxy_info{{version="{version}"}} 1

# HELP syncproxy_targets Number of known targets
# TYPE syncproxy_targets gauge
syncproxy_targets {targets}

# HELP syncproxy_targets_active Number of targets marked active
# TYPE syncproxy_targets_active gauge
syncproxy_targets_active {active}

# HELP syncproxy_sync_loops_running Number of sync loops executing
# TYPE syncproxy_sync_loops_running gauge
syncproxy_sync_loops_running {running}

# HELP syncproxy_syncs_total Successful /sync long-polls
# TYPE syncproxy_syncs_total counter
syncproxy_syncs_total {syncs}

# HELP syncproxy_sync_errors_total Failed /sync long-polls that were retried
# TYPE syncproxy_sync_errors_total counter
syncproxy_sync_errors_total {sync_errors}

# HELP syncproxy_sync_failures_total Sync loops that ended with an error
# TYPE syncproxy_sync_failures_total counter
syncproxy_sync_failures_total {sync_failures}

# HELP syncproxy_transactions_sent_total Transactions delivered downstream
# TYPE syncproxy_transactions_sent_total counter
syncproxy_transactions_sent_total {txns}

# HELP syncproxy_error_notifications_sent_total Error notifications delivered downstream
# TYPE syncproxy_error_notifications_sent_total counter
syncproxy_error_notifications_sent_total {notices}

# HELP syncproxy_delivery_retries_total Delivery attempts that were retried
# TYPE syncproxy_delivery_retries_total counter
syncproxy_delivery_retries_total {retries}

# HELP syncproxy_deliveries_failed_total Deliveries abandoned without success
# TYPE syncproxy_deliveries_failed_total counter
syncproxy_deliveries_failed_total {failed}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
