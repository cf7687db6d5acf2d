//! Prometheus metrics recorder, metric names and recording helpers.
//!
//! Recording is a no-op until [`install_recorder`] has run, so sessions and
//! tests record unconditionally.

use ::metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::channel::Side;
use crate::errors::{RelayError, Result};

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render the metrics endpoint.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RelayError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Sessions accepted (counter).
pub const SESSIONS_TOTAL: &str = "wsrelay_sessions_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "wsrelay_sessions_active";
/// Session terminations (counter, labels: reason).
pub const SESSION_CLOSES_TOTAL: &str = "wsrelay_session_closes_total";
/// Payload bytes forwarded (counter, labels: direction).
pub const BYTES_FORWARDED_TOTAL: &str = "wsrelay_bytes_forwarded_total";
/// Reader pauses applied by the governor (counter, labels: side).
pub const READ_PAUSES_TOTAL: &str = "wsrelay_read_pauses_total";
/// Upgrades refused at the connection limit (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "wsrelay_connections_rejected_total";

fn direction(from: Side) -> &'static str {
    match from {
        Side::Client => "client_to_upstream",
        Side::Upstream => "upstream_to_client",
    }
}

/// A session started.
pub fn session_opened() {
    counter!(SESSIONS_TOTAL).increment(1);
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// A session ended for `reason`.
pub fn session_closed(reason: &'static str) {
    counter!(SESSION_CLOSES_TOTAL, "reason" => reason).increment(1);
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// `bytes` of payload were forwarded away from `from`.
pub fn bytes_forwarded(from: Side, bytes: usize) {
    counter!(BYTES_FORWARDED_TOTAL, "direction" => direction(from)).increment(bytes as u64);
}

/// The governor paused reads on `side`.
pub fn reads_paused(side: Side) {
    counter!(READ_PAUSES_TOTAL, "side" => side.as_str()).increment(1);
}

/// An upgrade was refused because the server is full.
pub fn connection_rejected() {
    counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
}
