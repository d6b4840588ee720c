//! Health and liveness endpoints.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use solocast_sfu::BroadcasterStatus;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub broadcaster: BroadcasterStatus,
    pub viewer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, broadcaster, viewer_count) = match state.registry.status().await {
        Ok(s) => ("ok", s.broadcaster, s.viewer_count),
        Err(_) => ("degraded", BroadcasterStatus::Absent, 0),
    };

    Json(HealthResponse {
        status,
        uptime_secs: state.started_at.elapsed().as_secs(),
        started_at: state.started_wall,
        broadcaster,
        viewer_count,
        memory_rss_bytes: memory_rss_bytes(),
    })
}

pub async fn ping() -> &'static str {
    "pong"
}

/// Resident set size from procfs; absent on non-Linux hosts.
fn memory_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
