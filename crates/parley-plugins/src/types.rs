//! Plugin data types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_core::{InstanceId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::PluginHandler;

/// Which registry a plugin belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginKind {
    /// Event-triggered handler.
    Listener,
    /// Parameterized, on-demand handler.
    Action,
    /// Named state with an initial value.
    UiState,
    /// View bound to a UI state.
    Component,
}

impl PluginKind {
    /// All kinds, in startup order.
    pub const ALL: [Self; 4] = [Self::UiState, Self::Action, Self::Listener, Self::Component];

    /// Subdirectory name under the plugin root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Listener => "listeners",
            Self::Action => "actions",
            Self::UiState => "ui-states",
            Self::Component => "components",
        }
    }

    /// Whether templates of this kind must carry a handler.
    pub fn requires_handler(self) -> bool {
        matches!(self, Self::Listener | Self::Action)
    }

    /// Whether this kind supports parameterized instances.
    pub fn has_instances(self) -> bool {
        matches!(self, Self::Action | Self::Component)
    }

    /// Parse a kind from its directory name or display name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "listener" | "listeners" => Some(Self::Listener),
            "action" | "actions" => Some(Self::Action),
            "ui-state" | "ui-states" | "uiState" | "uiStates" => Some(Self::UiState),
            "component" | "components" => Some(Self::Component),
            _ => None,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listener => "listener",
            Self::Action => "action",
            Self::UiState => "ui-state",
            Self::Component => "component",
        })
    }
}

fn default_true() -> bool {
    true
}

/// The `config` block of a manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Unique within its registry.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the plugin does.
    #[serde(default)]
    pub description: String,
    /// Disabled templates load but never run.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listener: event name to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Action: JSON Schema for instance parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_schema: Option<Value>,
    /// UI state: value served before the first write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
    /// Component: UI state it renders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    /// Display icon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A loaded plugin: config plus its resolved handler.
#[derive(Clone)]
pub struct PluginTemplate {
    /// Parsed config.
    pub config: PluginConfig,
    /// Handler; `None` for config-only kinds.
    pub handler: Option<Arc<dyn PluginHandler>>,
    /// Manifest it came from.
    pub source: PathBuf,
}

impl PluginTemplate {
    /// Template id.
    pub fn id(&self) -> &str {
        &self.config.id
    }
}

impl fmt::Debug for PluginTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginTemplate")
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .field("source", &self.source)
            .finish()
    }
}

/// A parameterized Action or Component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    /// Generated id.
    pub instance_id: InstanceId,
    /// Template it was created from.
    pub template_id: String,
    /// Owning session; instances are removed with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Parameters (actions) or props (components).
    pub params: Value,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last creation or execution; drives idle eviction.
    pub last_used: DateTime<Utc>,
}

/// Normalized outcome of an action execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the handler succeeded.
    pub success: bool,
    /// Handler message or failure description.
    pub message: String,
    /// Handler payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time of the call.
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub(crate) const DEFAULT_MESSAGE: &'static str = "Action completed successfully";

    /// Normalize raw handler output.
    ///
    /// `null` is success; an object may override `success`, `message` and
    /// `data`; any other value becomes `data`.
    pub fn from_output(output: Value, duration_ms: u64) -> Self {
        match output {
            Value::Null => Self {
                success: true,
                message: Self::DEFAULT_MESSAGE.into(),
                data: None,
                error: None,
                duration_ms,
            },
            Value::Object(mut map) => {
                let success = map.get("success").and_then(Value::as_bool).unwrap_or(true);
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| Self::DEFAULT_MESSAGE.to_owned(), str::to_owned);
                let error = map.get("error").and_then(Value::as_str).map(str::to_owned);
                let data = map.remove("data");
                Self {
                    success,
                    message,
                    data,
                    error,
                    duration_ms,
                }
            }
            other => Self {
                success: true,
                message: Self::DEFAULT_MESSAGE.into(),
                data: Some(other),
                error: None,
                duration_ms,
            },
        }
    }

    /// Failure with `error` as both message and error.
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: error.clone(),
            data: None,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Normalized outcome of a listener invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerResult {
    /// Whether the listener acted on the event.
    pub executed: bool,
    /// Why it did or did not act.
    pub reason: String,
    /// Follow-up actions it reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    /// Extra payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ListenerResult {
    pub(crate) const DEFAULT_REASON: &'static str = "Listener completed successfully";

    /// Normalize raw handler output the same way as [`ExecutionResult::from_output`].
    pub fn from_output(output: Value) -> Self {
        match output {
            Value::Null => Self {
                executed: true,
                reason: Self::DEFAULT_REASON.into(),
                actions: None,
                data: None,
            },
            Value::Object(mut map) => {
                let executed = map.get("executed").and_then(Value::as_bool).unwrap_or(true);
                let reason = map
                    .get("reason")
                    .and_then(Value::as_str)
                    .map_or_else(|| Self::DEFAULT_REASON.to_owned(), str::to_owned);
                let actions = map.get("actions").and_then(Value::as_array).map(|arr| {
                    arr.iter()
                        .filter_map(|a| a.as_str().map(str::to_owned))
                        .collect()
                });
                let data = map.remove("data");
                Self {
                    executed,
                    reason,
                    actions,
                    data,
                }
            }
            other => Self {
                executed: true,
                reason: Self::DEFAULT_REASON.into(),
                actions: None,
                data: Some(other),
            },
        }
    }
}

/// Registry counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Registry kind.
    pub kind: PluginKind,
    /// Templates in the current snapshot.
    pub total_templates: usize,
    /// Enabled templates.
    pub enabled: usize,
    /// Template ids, sorted.
    pub template_ids: Vec<String>,
    /// Live instances.
    pub total_instances: usize,
    /// Listener templates per event name.
    pub by_event: BTreeMap<String, usize>,
    /// Reload counter.
    pub generation: u64,
}
