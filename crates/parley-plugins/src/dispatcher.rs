//! # Event dispatcher
//!
//! Routes a named event to every enabled Listener whose `event` matches.
//! Each match runs on its own task, bounded by a shared [`Semaphore`], and
//! produces exactly one audit entry whatever the handler does.

use std::sync::Arc;
use std::time::Duration;

use parley_audit::{AuditLogWriter, ExecutionLogEntry};
use parley_core::SessionId;
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::context::{Capabilities, PluginContext};
use crate::handler::invoke_guarded;
use crate::registry::{PluginRegistry, append_entry};
use crate::types::{ListenerResult, PluginTemplate};

/// Default concurrent listener invocations.
pub const DEFAULT_CONCURRENCY: usize = 32;

/// Reason recorded for invocations dropped under [`OverflowPolicy::Drop`].
pub const DROPPED_REASON: &str = "Dropped: dispatcher at capacity";

/// What happens when every permit is taken.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// `check_event` waits for a permit before spawning each invocation.
    #[default]
    Wait,
    /// The invocation is skipped and logged as not executed.
    Drop,
}

/// Receives every listener log entry after it is written.
pub trait LogObserver: Send + Sync {
    /// Called once per entry, from the invocation task.
    fn on_entry(&self, entry: &ExecutionLogEntry);
}

/// Result of one [`EventDispatcher::check_event`] call.
///
/// Dropping the handle detaches the invocations; [`join`](Self::join)
/// waits for them.
#[derive(Debug)]
pub struct DispatchHandle {
    /// Event name dispatched.
    pub event: String,
    /// Enabled listeners that matched.
    pub matched: usize,
    /// Invocations dropped for lack of capacity.
    pub dropped: usize,
    handles: Vec<JoinHandle<ExecutionLogEntry>>,
}

impl DispatchHandle {
    /// Invocations started.
    pub fn spawned(&self) -> usize {
        self.matched - self.dropped
    }

    /// Wait for every invocation and return its log entry.
    pub async fn join(self) -> Vec<ExecutionLogEntry> {
        let mut entries = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(event = %self.event, error = %e, "listener task failed"),
            }
        }
        entries
    }
}

/// Dispatches events to the Listener registry.
pub struct EventDispatcher {
    listeners: Arc<PluginRegistry>,
    audit: AuditLogWriter,
    caps: Arc<dyn Capabilities>,
    permits: Arc<Semaphore>,
    overflow: OverflowPolicy,
    timeout: Duration,
    observer: Option<Arc<dyn LogObserver>>,
}

impl EventDispatcher {
    /// Dispatcher over `listeners`, logging to `audit`.
    pub fn new(
        listeners: Arc<PluginRegistry>,
        audit: AuditLogWriter,
        caps: Arc<dyn Capabilities>,
    ) -> Self {
        Self {
            listeners,
            audit,
            caps,
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            overflow: OverflowPolicy::Wait,
            timeout: Duration::from_secs(30),
            observer: None,
        }
    }

    /// Bound concurrent invocations.
    #[must_use]
    pub fn with_concurrency(mut self, permits: usize, overflow: OverflowPolicy) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self.overflow = overflow;
        self
    }

    /// Per-invocation deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward every entry to `observer` after it is written.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LogObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Listener registry.
    pub fn listeners(&self) -> &Arc<PluginRegistry> {
        &self.listeners
    }

    /// Audit log for listener runs.
    pub fn audit(&self) -> &AuditLogWriter {
        &self.audit
    }

    /// Free permits right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Invoke every enabled listener registered for `event`.
    ///
    /// A string `sessionId` field in `payload` scopes the listeners'
    /// notifications to that session. Listeners run unordered and
    /// independently; a failing one never affects the others.
    #[instrument(skip_all, fields(event = %event))]
    pub async fn check_event(&self, event: &str, payload: Value) -> DispatchHandle {
        let matches = self.listeners.snapshot().listeners_for(event);
        let session_id = payload
            .get("sessionId")
            .and_then(Value::as_str)
            .map(SessionId::from);

        let mut handle = DispatchHandle {
            event: event.to_owned(),
            matched: matches.len(),
            dropped: 0,
            handles: Vec::with_capacity(matches.len()),
        };
        debug!(matched = handle.matched, "dispatching event");

        for template in matches {
            let permit = match self.overflow {
                OverflowPolicy::Wait => Arc::clone(&self.permits).acquire_owned().await.ok(),
                OverflowPolicy::Drop => Arc::clone(&self.permits).try_acquire_owned().ok(),
            };
            let Some(permit) = permit else {
                handle.dropped += 1;
                warn!(listener = %template.config.id, "dispatcher at capacity, dropping invocation");
                metrics::counter!("parley_listener_dropped_total").increment(1);
                handle.handles.push(self.spawn_dropped(&template, event, session_id.clone()));
                continue;
            };
            handle.handles.push(self.spawn_invocation(
                permit,
                template,
                event,
                payload.clone(),
                session_id.clone(),
            ));
        }
        handle
    }

    fn spawn_invocation(
        &self,
        permit: OwnedSemaphorePermit,
        template: Arc<PluginTemplate>,
        event: &str,
        payload: Value,
        session_id: Option<SessionId>,
    ) -> JoinHandle<ExecutionLogEntry> {
        let caps = Arc::clone(&self.caps);
        let audit = self.audit.clone();
        let observer = self.observer.clone();
        let timeout = self.timeout;
        let event = event.to_owned();

        tokio::spawn(async move {
            let _permit = permit;
            let id = template.config.id.clone();
            let ctx = PluginContext::new(
                id.clone(),
                template.config.name.clone(),
                session_id.clone(),
                caps,
            );

            let (outcome, duration_ms) = match &template.handler {
                Some(handler) => invoke_guarded(handler.as_ref(), payload, &ctx, timeout).await,
                None => (
                    Err(crate::errors::HandlerError::failed("listener has no handler")),
                    0,
                ),
            };

            let entry = match outcome {
                Ok(output) => {
                    let result = ListenerResult::from_output(output);
                    ExecutionLogEntry {
                        executed: result.executed,
                        reason: result.reason,
                        actions: result.actions,
                        data: result.data,
                        ..ExecutionLogEntry::executed(id.clone(), String::new())
                    }
                }
                Err(e) => {
                    warn!(listener = %id, event = %event, error = %e, "listener failed");
                    ExecutionLogEntry::failed(id.clone(), e.to_string())
                }
            }
            .with_duration_ms(duration_ms)
            .with_session(session_id.map(SessionId::into_inner));
            let entry = with_event(entry, &event);

            metrics::counter!(
                "parley_listener_invocations_total",
                "executed" => entry.executed.to_string()
            )
            .increment(1);
            finish(&audit, observer.as_deref(), entry).await
        })
    }

    fn spawn_dropped(
        &self,
        template: &PluginTemplate,
        event: &str,
        session_id: Option<SessionId>,
    ) -> JoinHandle<ExecutionLogEntry> {
        let audit = self.audit.clone();
        let observer = self.observer.clone();
        let mut entry = ExecutionLogEntry::executed(template.config.id.clone(), DROPPED_REASON)
            .with_session(session_id.map(SessionId::into_inner));
        entry.executed = false;
        let entry = with_event(entry, event);
        tokio::spawn(async move { finish(&audit, observer.as_deref(), entry).await })
    }
}

/// Tag an entry with the event that triggered it, keeping handler data.
fn with_event(mut entry: ExecutionLogEntry, event: &str) -> ExecutionLogEntry {
    entry.data = Some(match entry.data.take() {
        Some(data) => json!({"event": event, "result": data}),
        None => json!({"event": event}),
    });
    entry
}

async fn finish(
    audit: &AuditLogWriter,
    observer: Option<&dyn LogObserver>,
    entry: ExecutionLogEntry,
) -> ExecutionLogEntry {
    append_entry(audit, entry.clone()).await;
    if let Some(observer) = observer {
        observer.on_entry(&entry);
    }
    entry
}
