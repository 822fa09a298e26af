//! Prometheus recorder and the `/metrics` scrape endpoint.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything is recorded. The returned handle
/// renders the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text format of everything recorded so far.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "parley_ws_connections_total";
/// Open connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "parley_ws_connections_active";
/// Upgrades refused at capacity (counter).
pub const WS_REJECTED_TOTAL: &str = "parley_ws_rejected_total";
/// Inbound text frames (counter).
pub const WS_MESSAGES_TOTAL: &str = "parley_ws_messages_total";
/// Panics caught while routing a frame (counter).
pub const WS_ROUTE_PANICS_TOTAL: &str = "parley_ws_route_panics_total";
/// Outbound frames dropped on a full queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "parley_ws_send_drops_total";
/// Connections closed for a missed pong (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "parley_ws_heartbeat_timeouts_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "parley_ws_connection_duration_seconds";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
/// Conversation turns run (counter).
pub const SESSION_TURNS_TOTAL: &str = "parley_session_turns_total";
/// Turns that ended in a provider error (counter).
pub const SESSION_TURN_ERRORS_TOTAL: &str = "parley_session_turn_errors_total";
/// Events accepted over HTTP (counter).
pub const EVENTS_INGESTED_TOTAL: &str = "parley_events_ingested_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_metrics() {
        // local recorder, no global install
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(SESSION_TURNS_TOTAL).increment(3);
        });

        let text = render(&handle);
        assert!(text.contains("parley_session_turns_total 3"), "{text}");
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_REJECTED_TOTAL,
            WS_MESSAGES_TOTAL,
            WS_ROUTE_PANICS_TOTAL,
            WS_SEND_DROPS_TOTAL,
            WS_HEARTBEAT_TIMEOUTS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            SESSIONS_ACTIVE,
            SESSION_TURNS_TOTAL,
            SESSION_TURN_ERRORS_TOTAL,
            EVENTS_INGESTED_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("parley_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
