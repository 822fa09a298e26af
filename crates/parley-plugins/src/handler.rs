//! # Plugin handlers
//!
//! A handler takes a JSON input (event payload or instance parameters) and
//! a [`PluginContext`] and returns JSON output or a [`HandlerError`].
//!
//! Manifests bind handlers two ways:
//! - `{"builtin": "name"}` looks up a [`HandlerCatalog`] entry registered by
//!   the embedding binary
//! - `{"command": "...", "args": [...]}` runs a [`CommandHandler`]

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parley_core::envelope::Priority;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::context::{LogLevel, PluginContext};
use crate::errors::HandlerError;

/// Plugin logic.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Run once.
    async fn handle(&self, input: Value, ctx: &PluginContext) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PluginHandler for FnHandler<F>
where
    F: Fn(Value, PluginContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, input: Value, ctx: &PluginContext) -> Result<Value, HandlerError> {
        (self.0)(input, ctx.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PluginHandler>
where
    F: Fn(Value, PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Named in-process handlers that manifests can refer to.
#[derive(Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn PluginHandler>>,
}

impl HandlerCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a builtin.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn PluginHandler>) {
        let _ = self.handlers.insert(name.into(), handler);
    }

    /// Builder form of [`HandlerCatalog::register`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn PluginHandler>) -> Self {
        self.register(name, handler);
        self
    }

    /// Look up a builtin.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Runs an external program per invocation.
///
/// The program receives `{"input", "plugin": {"id", "name"}, "sessionId"}`
/// on stdin and prints one JSON value on stdout. An optional `effects` array
/// in the output is applied through the context:
/// `{"notify": {"message", "priority"}}`, `{"setState": {"stateId", "data"}}`,
/// `{"log": {"level", "message"}}`.
#[derive(Clone, Debug)]
pub struct CommandHandler {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHandler {
    /// Handler for `program args...` with a per-run timeout.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while stdout and stderr drain, so a program that writes
        // before it reads cannot fill a pipe and stall both sides. A program
        // that exits without reading stdin closes the pipe early; its exit
        // status is the interesting part then.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            let written = match stdin.write_all(request).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let waited = child.wait_with_output();
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, waited);
            fed.and(output)
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HandlerError::Timeout {
                    timeout_ms: millis(self.timeout),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl PluginHandler for CommandHandler {
    async fn handle(&self, input: Value, ctx: &PluginContext) -> Result<Value, HandlerError> {
        let request = serde_json::to_vec(&json!({
            "input": input,
            "plugin": {"id": ctx.plugin_id(), "name": ctx.plugin_name()},
            "sessionId": ctx.session_id(),
        }))?;

        debug!(program = %self.program.display(), plugin = ctx.plugin_id(), "running command handler");
        let stdout = self.run(&request).await?;
        let mut output = parse_output(&stdout)?;

        if let Some(effects) = output.as_object_mut().and_then(|m| m.remove("effects")) {
            apply_effects(ctx, effects).await?;
        }
        Ok(output)
    }
}

/// Whole stdout as JSON, falling back to its last non-empty line so
/// programs may print diagnostics before the result.
fn parse_output(stdout: &[u8]) -> Result<Value, HandlerError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(trimmed) {
        Ok(v) => Ok(v),
        Err(e) => trimmed
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
            .ok_or(HandlerError::Json(e)),
    }
}

async fn apply_effects(ctx: &PluginContext, effects: Value) -> Result<(), HandlerError> {
    let Value::Array(effects) = effects else {
        return Err(HandlerError::failed("`effects` must be an array"));
    };
    for effect in effects {
        if let Some(n) = effect.get("notify") {
            let message = n.get("message").and_then(Value::as_str).unwrap_or_default();
            let priority: Priority = n
                .get("priority")
                .cloned()
                .and_then(|p| serde_json::from_value(p).ok())
                .unwrap_or_default();
            ctx.notify(message, priority).await;
        } else if let Some(s) = effect.get("setState") {
            let state_id = s
                .get("stateId")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::failed("setState effect without stateId"))?;
            let data = s.get("data").cloned().unwrap_or(Value::Null);
            ctx.set_state(state_id, data).await?;
        } else if let Some(l) = effect.get("log") {
            let level: LogLevel = l
                .get("level")
                .cloned()
                .and_then(|p| serde_json::from_value(p).ok())
                .unwrap_or_default();
            let message = l.get("message").and_then(Value::as_str).unwrap_or_default();
            ctx.log(level, message).await;
        } else {
            warn!(plugin = ctx.plugin_id(), %effect, "ignoring unknown effect");
        }
    }
    Ok(())
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Run a handler under a deadline, turning panics into errors.
pub(crate) async fn invoke_guarded(
    handler: &dyn PluginHandler,
    input: Value,
    ctx: &PluginContext,
    timeout: Duration,
) -> (Result<Value, HandlerError>, u64) {
    let start = Instant::now();
    let fut = AssertUnwindSafe(handler.handle(input, ctx)).catch_unwind();
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(HandlerError::Timeout {
            timeout_ms: millis(timeout),
        }),
    };
    (result, millis(start.elapsed()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
