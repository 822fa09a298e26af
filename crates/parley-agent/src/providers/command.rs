//! Completion provider backed by an external stream-JSON CLI.
//!
//! The program is run once per call as `command args... [--model m]
//! [--resume token] [--system-prompt p] <prompt>` and must print one JSON
//! object per line:
//!
//! - `{"type": "system", "subtype": "init", "session_id": ...}`
//! - `{"type": "assistant", "message": {"content": [<text | tool_use>...]}}`
//! - `{"type": "user", "message": {"content": [<tool_result>...]}}`
//! - `{"type": "result", "subtype": ..., "is_error": ..., "session_id": ...,
//!   "total_cost_usd": ..., "duration_ms": ...}`

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::{CompletionProvider, ProviderError, ProviderEvent, ProviderEventStream, QueryOptions};
use parley_settings::ProviderSettings;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

/// Longest accepted output line.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Spawns the configured CLI per call and translates its output lines.
#[derive(Clone, Debug)]
pub struct CommandProvider {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    working_dir: Option<PathBuf>,
}

impl CommandProvider {
    /// Provider running `command args...`.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            model: None,
            working_dir: None,
        }
    }

    /// Provider configured from settings.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            model: settings.model.clone(),
            working_dir: settings.working_dir.clone(),
            ..Self::new(settings.command.clone(), settings.args.clone())
        }
    }

    fn command_args(&self, prompt: &str, options: &QueryOptions) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(token) = &options.continuation_token {
            args.extend(["--resume".to_string(), token.clone()]);
        }
        if let Some(system) = &options.system_prompt {
            args.extend(["--system-prompt".to_string(), system.clone()]);
        }
        // the prompt is user text, never an option
        args.push("--".to_string());
        args.push(structured_prompt(prompt, options));
        args
    }
}

/// The CLI cannot be made to call a tool, so a forced tool becomes an
/// instruction to answer with JSON matching its schema.
fn structured_prompt(prompt: &str, options: &QueryOptions) -> String {
    let Some(forced) = &options.forced_tool else {
        return prompt.to_string();
    };
    let Some(tool) = options.tools.iter().find(|t| &t.name == forced) else {
        return prompt.to_string();
    };
    format!(
        "{prompt}\n\nRespond with a single JSON object and nothing else. \
         It must match this JSON Schema:\n{}",
        tool.input_schema
    )
}

#[async_trait]
impl CompletionProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.command
    }

    async fn query(
        &self,
        prompt: &str,
        options: QueryOptions,
    ) -> Result<ProviderEventStream, ProviderError> {
        let mut cmd = Command::new(&self.command);
        let _ = cmd
            .args(self.command_args(prompt, &options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            let _ = cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProviderError::Unavailable(format!("failed to start '{}': {e}", self.command))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("provider stdout not captured".into()))?;
        let stderr = child.stderr.take();
        debug!(command = %self.command, resume = options.continuation_token.is_some(), "provider started");

        // Drained concurrently so a chatty stderr cannot block the child.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            let text = String::from_utf8_lossy(&buf);
            let text = text.trim();
            let start = text.len().saturating_sub(STDERR_TAIL_BYTES);
            let start = (start..text.len())
                .find(|i| text.is_char_boundary(*i))
                .unwrap_or(text.len());
            text[start..].to_string()
        });

        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let stream = async_stream::stream! {
            let mut finished = false;
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(ProviderError::Protocol(e.to_string()));
                        return;
                    }
                };
                for event in parse_line(&line) {
                    finished |= matches!(event, ProviderEvent::Result { .. });
                    yield Ok(event);
                }
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    yield Err(ProviderError::Io(e));
                    return;
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();
            if !finished {
                let detail = if stderr.is_empty() {
                    format!("provider exited with {status} before a result")
                } else {
                    format!("provider exited with {status}: {stderr}")
                };
                yield Err(ProviderError::Other(detail));
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Translate one output line. Blank, non-JSON and unrecognised lines yield
/// nothing.
pub fn parse_line(line: &str) -> Vec<ProviderEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping non-JSON provider line");
            return Vec::new();
        }
    };

    match value["type"].as_str() {
        Some("system") if value["subtype"] == "init" => value["session_id"]
            .as_str()
            .map(|id| ProviderEvent::Init {
                continuation_token: id.to_string(),
            })
            .into_iter()
            .collect(),
        Some("assistant" | "user") => content_blocks(&value)
            .iter()
            .filter_map(content_event)
            .collect(),
        Some("result") => vec![result_event(&value)],
        _ => Vec::new(),
    }
}

fn content_blocks(value: &Value) -> &[Value] {
    value["message"]["content"]
        .as_array()
        .map_or(&[][..], Vec::as_slice)
}

fn content_event(block: &Value) -> Option<ProviderEvent> {
    match block["type"].as_str()? {
        "text" => Some(ProviderEvent::Text {
            text: block["text"].as_str()?.to_string(),
        }),
        "tool_use" => Some(ProviderEvent::ToolUse {
            id: str_field(block, "id"),
            name: str_field(block, "name"),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ProviderEvent::ToolResult {
            tool_use_id: str_field(block, "tool_use_id"),
            content: block.get("content").cloned().unwrap_or(Value::Null),
            is_error: block["is_error"].as_bool().unwrap_or(false),
        }),
        _ => None,
    }
}

fn result_event(value: &Value) -> ProviderEvent {
    let subtype = value["subtype"].as_str().unwrap_or("success");
    let success = subtype == "success" && !value["is_error"].as_bool().unwrap_or(false);
    let error = (!success).then(|| {
        value["result"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(subtype)
            .to_string()
    });
    ProviderEvent::Result {
        success,
        continuation_token: value["session_id"].as_str().map(str::to_string),
        cost_usd: value["total_cost_usd"].as_f64(),
        duration_ms: value["duration_ms"].as_u64(),
        error,
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}
