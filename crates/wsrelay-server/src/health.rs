//! Health and stats endpoint bodies.

use serde::Serialize;
use std::time::Instant;

/// Body of the liveness probe.
pub const HEALTH_BODY: &str = "OK";

/// Stats response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions currently open.
    pub connections: usize,
    /// Sessions accepted since start.
    pub total_sessions: u64,
}

/// Build a stats response from live counters.
pub fn stats(start_time: Instant, connections: usize, total_sessions: u64) -> StatsResponse {
    StatsResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        total_sessions,
    }
}
