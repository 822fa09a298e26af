//! `/health` endpoint.

use std::time::Instant;

use parley_plugins::PluginKind;
use serde::Serialize;

use crate::gateway::Gateway;

/// Template and instance counts for one registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCounts {
    /// Registry kind.
    pub kind: PluginKind,
    /// Templates loaded.
    pub templates: usize,
    /// Live instances.
    pub instances: usize,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open `WebSocket` connections.
    pub connections: usize,
    /// Live conversation sessions.
    pub sessions: usize,
    /// Free listener dispatch permits.
    pub dispatch_permits: usize,
    /// Per-registry counts.
    pub plugins: Vec<PluginCounts>,
}

/// Build a health response from the gateway's live counters.
pub fn health_check(start_time: Instant, gateway: &Gateway) -> HealthResponse {
    let plugins = PluginKind::ALL
        .into_iter()
        .map(|kind| {
            let registry = gateway.plugins().registry(kind);
            PluginCounts {
                kind,
                templates: registry.snapshot().len(),
                instances: registry.instance_count(),
            }
        })
        .collect();
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: gateway.connections().count(),
        sessions: gateway.sessions().len(),
        dispatch_permits: gateway.dispatcher().available_permits(),
        plugins,
    }
}
