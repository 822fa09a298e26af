//! Settings structures.
//!
//! Every section deserializes with `#[serde(default)]`, so a settings file
//! only needs the keys it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Network and session lifecycle.
    pub server: ServerSettings,
    /// Plugin discovery, reload and dispatch.
    pub plugins: PluginSettings,
    /// Audit log location.
    pub audit: AuditSettings,
    /// External completion provider.
    pub provider: ProviderSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.plugins.dispatch_concurrency == 0 {
            return Err(SettingsError::InvalidValue(
                "plugins.dispatchConcurrency must be greater than 0".into(),
            ));
        }
        if self.server.snapshot_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.snapshotIntervalMs must be greater than 0".into(),
            ));
        }
        if self.server.send_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendBuffer must be greater than 0".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be shorter than the interval".into(),
            ));
        }
        if self.provider.command.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "provider.command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Network and session lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port; 0 picks a free port.
    pub port: u16,
    /// Connections accepted at once.
    pub max_connections: usize,
    /// Ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub send_buffer: usize,
    /// How long a session may sit without subscribers before removal.
    pub session_grace_period_ms: u64,
    /// Interval of the periodic snapshot push.
    pub snapshot_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_connections: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 1024 * 1024,
            send_buffer: 1024,
            session_grace_period_ms: 60_000,
            snapshot_interval_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.session_grace_period_ms)
    }

    /// Snapshot interval as a [`Duration`].
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// What the dispatcher does when every worker permit is taken.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Make the caller of `check_event` wait for a permit.
    #[default]
    Wait,
    /// Drop the invocation and record it as not executed.
    Drop,
}

/// Plugin discovery, reload and dispatch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Directory holding `listeners/`, `actions/`, `ui-states/`, `components/`.
    pub root_dir: PathBuf,
    /// Reload registries when their directory changes.
    pub watch: bool,
    /// Quiet period before a reload, in milliseconds.
    pub reload_debounce_ms: u64,
    /// Listener invocations allowed to run at once.
    pub dispatch_concurrency: usize,
    /// Behaviour when the dispatcher is saturated.
    pub overflow: OverflowMode,
    /// Per-invocation handler timeout, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Idle time after which an action/component instance is evicted.
    pub instance_ttl_ms: u64,
    /// How often the eviction sweep runs.
    pub eviction_interval_ms: u64,
    /// Where UI-state values are persisted, one JSON file per state id.
    pub state_dir: PathBuf,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("plugins"),
            watch: true,
            reload_debounce_ms: 250,
            dispatch_concurrency: 32,
            overflow: OverflowMode::Wait,
            handler_timeout_ms: 30_000,
            instance_ttl_ms: 24 * 60 * 60 * 1000,
            eviction_interval_ms: 10 * 60 * 1000,
            state_dir: PathBuf::from(".state"),
        }
    }
}

impl PluginSettings {
    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Instance TTL as a [`Duration`].
    pub fn instance_ttl(&self) -> Duration {
        Duration::from_millis(self.instance_ttl_ms)
    }

    /// Eviction sweep interval as a [`Duration`].
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    /// Reload debounce as a [`Duration`].
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

/// Audit log settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditSettings {
    /// Root directory; each registry writes to its own subdirectory.
    pub dir: PathBuf,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".logs"),
        }
    }
}

/// External completion provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Executable that speaks the stream-JSON protocol.
    pub command: String,
    /// Arguments passed before the prompt.
    pub args: Vec<String>,
    /// Model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Working directory for the provider process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            model: None,
            system_prompt: None,
            working_dir: None,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
