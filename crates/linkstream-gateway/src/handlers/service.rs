//! Service-level handlers (status, health)

use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use linkstream_core::{AdmissionSnapshot, CacheStats, ClientSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub uptime: String,
    pub uptime_secs: u64,
    pub version: &'static str,
    pub active_clients: usize,
    pub total_clients: usize,
    pub workload_distribution: Vec<ClientSnapshot>,
    pub cache_utilization: CacheUtilization,
    pub admission: AdmissionSnapshot,
}

#[derive(Debug, Serialize)]
pub struct CacheUtilization {
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Entries as a percentage of capacity
    pub utilization_percent: f64,
}

/// GET /status - pool, cache and admission overview
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    let clients = state.pool.snapshot();
    let active_clients = clients.iter().filter(|c| c.state == "available").count();
    let status = if state.pool.is_exhausted() {
        "unavailable"
    } else if active_clients < clients.len() {
        "degraded"
    } else {
        "operational"
    };

    let stats = state.streamer.cache().stats();
    let utilization_percent = if stats.capacity == 0 {
        0.0
    } else {
        (stats.entries as f64 / stats.capacity as f64 * 1000.0).round() / 10.0
    };

    let uptime = state.started_at.elapsed();
    Json(StatusReport {
        status,
        uptime: readable_duration(uptime),
        uptime_secs: uptime.as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        active_clients,
        total_clients: clients.len(),
        workload_distribution: clients,
        cache_utilization: CacheUtilization {
            stats,
            utilization_percent,
        },
        admission: state.admission.snapshot(),
    })
}

/// HEAD / - Health check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// `1d 2h 3m 4s`, leading zero units omitted
pub fn readable_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let parts = [
        (secs / 86_400, "d"),
        (secs % 86_400 / 3_600, "h"),
        (secs % 3_600 / 60, "m"),
    ];
    let mut out: Vec<String> = parts
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect();
    out.push(format!("{}s", secs % 60));
    out.join(" ")
}
