//! # Completion provider seam
//!
//! A provider turns a prompt into a stream of [`ProviderEvent`]s ending in a
//! terminal [`ProviderEvent::Result`]. Sessions translate these events into
//! outbound messages; nothing in the broker knows how the stream is produced.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed stream returned by [`CompletionProvider::query`].
pub type ProviderEventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// One event emitted during a provider call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProviderEvent {
    /// Call started; carries the token used to resume this conversation.
    #[serde(rename_all = "camelCase")]
    Init {
        /// Continuation token for the next turn.
        continuation_token: String,
    },
    /// Assistant text.
    Text {
        /// Text content.
        text: String,
    },
    /// The model invoked a tool.
    ToolUse {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// A tool finished.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// Matching tool call id.
        tool_use_id: String,
        /// Tool output.
        content: Value,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },
    /// Terminal event.
    #[serde(rename_all = "camelCase")]
    Result {
        /// Whether the turn succeeded.
        success: bool,
        /// Fresh continuation token, if the provider sent one.
        #[serde(default)]
        continuation_token: Option<String>,
        /// Cost in USD.
        #[serde(default)]
        cost_usd: Option<f64>,
        /// Duration in milliseconds.
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Failure subtype when unsuccessful.
        #[serde(default)]
        error: Option<String>,
    },
}

/// A tool the provider may call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON Schema for the arguments.
    pub input_schema: Value,
}

/// Options for one provider call.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Resume this conversation instead of starting a new one.
    pub continuation_token: Option<String>,
    /// Tools offered to the model.
    pub tools: Vec<ToolSpec>,
    /// Override the system prompt.
    pub system_prompt: Option<String>,
    /// Require the model to call this tool.
    pub forced_tool: Option<String>,
}

impl QueryOptions {
    /// Fresh call, no continuation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with `token` when present.
    #[must_use]
    pub fn resume(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }
}

/// Errors raised by a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider process or endpoint could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider emitted something unparseable.
    #[error("malformed provider output: {0}")]
    Protocol(String),

    /// I/O while talking to the provider.
    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider reported a failure.
    #[error("{0}")]
    Other(String),
}

/// Streaming completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start a call. Errors here mean the call never started; errors inside
    /// the stream mean it broke midway.
    async fn query(
        &self,
        prompt: &str,
        options: QueryOptions,
    ) -> Result<ProviderEventStream, ProviderError>;
}
