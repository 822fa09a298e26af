//! # Plugin context
//!
//! Handlers reach the host only through [`PluginContext`], which wraps one
//! injected [`Capabilities`] object. Every capability is async so plugins
//! see a single calling convention.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parley_core::envelope::Priority;
use parley_core::{
    CompletionProvider, Notification, ProviderEvent, QueryOptions, SessionId, ToolSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::errors::HandlerError;
use crate::ui_state::UiStateManager;

/// Tool name forced when a plugin asks for structured output.
const RESPOND_TOOL: &str = "respond";

/// Severity for [`PluginContext::log`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose.
    Debug,
    /// Default.
    #[default]
    Info,
    /// Unexpected but handled.
    Warn,
    /// Failure.
    Error,
}

/// Where plugin notifications go.
pub trait NotificationSink: Send + Sync {
    /// Deliver without blocking.
    fn deliver(&self, notification: Notification);
}

/// Host services available to handlers.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Push a notification to clients.
    async fn notify(&self, notification: Notification);

    /// Record a plugin log line.
    async fn log(&self, source_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(plugin = source_id, "{message}"),
            LogLevel::Info => info!(plugin = source_id, "{message}"),
            LogLevel::Warn => warn!(plugin = source_id, "{message}"),
            LogLevel::Error => error!(plugin = source_id, "{message}"),
        }
    }

    /// Ask the completion provider. With a non-null `schema` the answer is
    /// the structured value matching it, otherwise the plain text.
    async fn call_agent(&self, prompt: &str, schema: Value) -> Result<Value, HandlerError>;

    /// Read a UI state.
    async fn get_state(&self, state_id: &str) -> Result<Option<Value>, HandlerError>;

    /// Write a UI state.
    async fn set_state(&self, state_id: &str, data: Value) -> Result<(), HandlerError>;
}

/// Per-invocation view of the host.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    plugin_name: String,
    session_id: Option<SessionId>,
    caps: Arc<dyn Capabilities>,
}

impl PluginContext {
    /// Context for one invocation of `plugin_id`.
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_name: impl Into<String>,
        session_id: Option<SessionId>,
        caps: Arc<dyn Capabilities>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_name: plugin_name.into(),
            session_id,
            caps,
        }
    }

    /// Invoking plugin's id.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Invoking plugin's name.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Session this invocation belongs to, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Notify clients. Scoped to the invocation's session when it has one.
    pub async fn notify(&self, message: impl Into<String>, priority: Priority) {
        self.caps
            .notify(Notification {
                source_id: self.plugin_id.clone(),
                source_name: self.plugin_name.clone(),
                message: message.into(),
                priority,
                session_id: self.session_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Log on behalf of the plugin.
    pub async fn log(&self, level: LogLevel, message: &str) {
        self.caps.log(&self.plugin_id, level, message).await;
    }

    /// See [`Capabilities::call_agent`].
    pub async fn call_agent(&self, prompt: &str, schema: Value) -> Result<Value, HandlerError> {
        self.caps.call_agent(prompt, schema).await
    }

    /// Read a UI state.
    pub async fn get_state(&self, state_id: &str) -> Result<Option<Value>, HandlerError> {
        self.caps.get_state(state_id).await
    }

    /// Write a UI state.
    pub async fn set_state(&self, state_id: &str, data: Value) -> Result<(), HandlerError> {
        self.caps.set_state(state_id, data).await
    }
}

/// The broker's [`Capabilities`]: notifications go to a sink, agent calls
/// to the completion provider, state to the [`UiStateManager`].
pub struct HostCapabilities {
    sink: Arc<dyn NotificationSink>,
    provider: Option<Arc<dyn CompletionProvider>>,
    ui_state: Option<Arc<UiStateManager>>,
}

impl HostCapabilities {
    /// Notifications only; agent and state calls fail until configured.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            provider: None,
            ui_state: None,
        }
    }

    /// Enable `call_agent`.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Enable state access.
    #[must_use]
    pub fn with_ui_state(mut self, ui_state: Arc<UiStateManager>) -> Self {
        self.ui_state = Some(ui_state);
        self
    }

    fn ui_state(&self, capability: &'static str) -> Result<&UiStateManager, HandlerError> {
        self.ui_state
            .as_deref()
            .ok_or_else(|| HandlerError::Capability {
                capability,
                message: "no UI state manager configured".into(),
            })
    }
}

fn agent_error(message: impl Into<String>) -> HandlerError {
    HandlerError::Capability {
        capability: "call_agent",
        message: message.into(),
    }
}

#[async_trait]
impl Capabilities for HostCapabilities {
    async fn notify(&self, notification: Notification) {
        self.sink.deliver(notification);
    }

    async fn call_agent(&self, prompt: &str, schema: Value) -> Result<Value, HandlerError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| agent_error("no completion provider configured"))?;

        let structured = !schema.is_null();
        let mut options = QueryOptions::new();
        if structured {
            options.tools.push(ToolSpec {
                name: RESPOND_TOOL.into(),
                description: "Return the answer as structured data".into(),
                input_schema: schema,
            });
            options.forced_tool = Some(RESPOND_TOOL.into());
        }

        let mut stream = provider
            .query(prompt, options)
            .await
            .map_err(|e| agent_error(e.to_string()))?;

        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event.map_err(|e| agent_error(e.to_string()))? {
                ProviderEvent::ToolUse { name, input, .. } if structured && name == RESPOND_TOOL => {
                    return Ok(input);
                }
                ProviderEvent::Text { text: chunk } => text.push_str(&chunk),
                ProviderEvent::Result {
                    success: false,
                    error,
                    ..
                } => {
                    return Err(agent_error(
                        error.unwrap_or_else(|| "provider reported failure".into()),
                    ));
                }
                _ => {}
            }
        }

        if !structured {
            return Ok(Value::String(text));
        }
        serde_json::from_str(text.trim())
            .map_err(|_| agent_error("provider returned no structured response"))
    }

    async fn get_state(&self, state_id: &str) -> Result<Option<Value>, HandlerError> {
        self.ui_state("get_state")?
            .get_state(state_id)
            .await
            .map_err(|e| HandlerError::Capability {
                capability: "get_state",
                message: e.to_string(),
            })
    }

    async fn set_state(&self, state_id: &str, data: Value) -> Result<(), HandlerError> {
        self.ui_state("set_state")?
            .set_state(state_id, data)
            .await
            .map_err(|e| HandlerError::Capability {
                capability: "set_state",
                message: e.to_string(),
            })
    }
}
