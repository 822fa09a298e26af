//! Server configuration.

use std::time::Duration;

use parley_settings::ServerSettings;

/// Runtime configuration for the gateway and HTTP listener.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent `WebSocket` connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub send_buffer: usize,
    /// How long a session may sit without subscribers before removal.
    pub session_grace_period: Duration,
    /// Period of the all-connections snapshot push.
    pub snapshot_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 1024 * 1024,
            send_buffer: 1024,
            session_grace_period: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(5),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            max_message_size: s.max_message_size,
            send_buffer: s.send_buffer,
            session_grace_period: s.grace_period(),
            snapshot_interval: s.snapshot_interval(),
        }
    }
}
