//! # Plugin registry
//!
//! Holds the templates of one [`PluginKind`] as an immutable
//! [`RegistrySnapshot`] behind an [`ArcSwap`]. Reloads build a complete new
//! snapshot and publish it with a single store, so readers always see either
//! the old or the new set, never a mix.
//!
//! Action and Component registries also own parameterized
//! [`PluginInstance`]s. Instances are dropped when their session goes away
//! or after sitting idle longer than the configured TTL.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use parley_audit::{AuditLogWriter, ExecutionLogEntry};
use parley_core::{InstanceId, SessionId};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{Capabilities, PluginContext};
use crate::errors::PluginError;
use crate::handler::{HandlerCatalog, invoke_guarded};
use crate::manifest::discover_templates;
use crate::types::{ExecutionResult, PluginInstance, PluginKind, PluginTemplate, RegistryStats};

/// Default per-invocation handler deadline.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// One complete, immutable set of templates.
#[derive(Debug)]
pub struct RegistrySnapshot {
    templates: HashMap<String, Arc<PluginTemplate>>,
    generation: u64,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            templates: HashMap::new(),
            generation: 0,
            loaded_at: Utc::now(),
        }
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<&Arc<PluginTemplate>> {
        self.templates.get(id)
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether there are no templates.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates sorted by id.
    pub fn templates(&self) -> Vec<Arc<PluginTemplate>> {
        let mut all: Vec<_> = self.templates.values().cloned().collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        all
    }

    /// Enabled templates listening for `event`.
    pub fn listeners_for(&self, event: &str) -> Vec<Arc<PluginTemplate>> {
        self.templates
            .values()
            .filter(|t| t.config.enabled && t.config.event.as_deref() == Some(event))
            .cloned()
            .collect()
    }

    /// Reload counter; 0 before the first discovery.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When this snapshot was built.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Templates and instances of one plugin kind.
pub struct PluginRegistry {
    kind: PluginKind,
    dir: PathBuf,
    catalog: Arc<HandlerCatalog>,
    snapshot: ArcSwap<RegistrySnapshot>,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
    instances: RwLock<HashMap<InstanceId, PluginInstance>>,
    audit: Option<AuditLogWriter>,
    handler_timeout: Duration,
}

impl PluginRegistry {
    /// Empty registry reading manifests from `dir`. Call
    /// [`discover`](Self::discover) to load.
    pub fn new(kind: PluginKind, dir: impl Into<PathBuf>, catalog: Arc<HandlerCatalog>) -> Self {
        Self {
            kind,
            dir: dir.into(),
            catalog,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::empty()),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            instances: RwLock::new(HashMap::new()),
            audit: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Record every [`execute`](Self::execute) call here.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLogWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Deadline for one handler call.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Registry kind.
    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Manifest directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Templates ──

    /// Rescan the directory and publish a fresh snapshot. Returns the number
    /// of templates loaded.
    pub fn discover(&self) -> usize {
        let _guard = self.reload_lock.lock();

        let mut templates = HashMap::new();
        for template in discover_templates(&self.dir, self.kind, &self.catalog) {
            let id = template.config.id.clone();
            if let Some(previous) = templates.insert(id.clone(), Arc::new(template)) {
                warn!(
                    kind = %self.kind,
                    id = %id,
                    replaced = %previous.source.display(),
                    "duplicate plugin id, later file wins"
                );
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let count = templates.len();
        self.snapshot.store(Arc::new(RegistrySnapshot {
            templates,
            generation,
            loaded_at: Utc::now(),
        }));
        info!(kind = %self.kind, count, generation, "plugin registry loaded");
        #[allow(clippy::cast_precision_loss)]
        let gauge_value = count as f64;
        metrics::gauge!("parley_plugin_templates", "kind" => self.kind.to_string()).set(gauge_value);
        count
    }

    /// Current snapshot. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Look up a template in the current snapshot.
    pub fn get_template(&self, id: &str) -> Option<Arc<PluginTemplate>> {
        self.snapshot.load().get(id).cloned()
    }

    /// Current templates sorted by id.
    pub fn templates(&self) -> Vec<Arc<PluginTemplate>> {
        self.snapshot.load().templates()
    }

    // ── Instances ──

    /// Create an instance of `template_id`.
    pub fn create_instance(
        &self,
        template_id: &str,
        session_id: Option<SessionId>,
        params: Value,
        label: Option<String>,
    ) -> Result<PluginInstance, PluginError> {
        if self.get_template(template_id).is_none() {
            return Err(PluginError::TemplateNotFound {
                kind: self.kind,
                id: template_id.to_owned(),
            });
        }

        let now = Utc::now();
        let instance = PluginInstance {
            instance_id: InstanceId::generate(),
            template_id: template_id.to_owned(),
            session_id,
            params,
            label,
            created_at: now,
            last_used: now,
        };
        let _ = self
            .instances
            .write()
            .insert(instance.instance_id.clone(), instance.clone());
        debug!(kind = %self.kind, instance_id = %instance.instance_id, template_id, "instance created");
        Ok(instance)
    }

    /// Look up an instance.
    pub fn get_instance(&self, instance_id: &str) -> Option<PluginInstance> {
        self.instances.read().get(instance_id).cloned()
    }

    /// Instances owned by `session_id`, oldest first.
    pub fn instances_for_session(&self, session_id: &str) -> Vec<PluginInstance> {
        let mut found: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        found
    }

    /// Remove one instance. Returns whether it existed.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        self.instances.write().remove(instance_id).is_some()
    }

    /// Remove every instance owned by `session_id`.
    pub fn remove_session_instances(&self, session_id: &str) -> usize {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|_, i| i.session_id.as_deref() != Some(session_id));
        let removed = before - instances.len();
        if removed > 0 {
            debug!(kind = %self.kind, session_id, removed, "session instances removed");
        }
        removed
    }

    /// Drop instances unused since `now - ttl`.
    pub fn evict_idle(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = now - ttl;
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|_, i| i.last_used >= cutoff);
        before - instances.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until cancelled.
    pub fn spawn_eviction(
        self: Arc<Self>,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle(ttl, Utc::now());
                        if evicted > 0 {
                            info!(kind = %self.kind, evicted, "evicted idle instances");
                        }
                    }
                }
            }
        })
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    // ── Execution ──

    /// Run an instance's handler.
    ///
    /// Never fails: unknown instances or templates, handler errors, timeouts
    /// and panics all come back as an unsuccessful [`ExecutionResult`]. One
    /// audit entry is written per call.
    pub async fn execute(
        &self,
        instance_id: &str,
        caps: Arc<dyn Capabilities>,
    ) -> ExecutionResult {
        let Some(instance) = self.touch_instance(instance_id) else {
            let result = ExecutionResult::failure(format!("{} instance not found", self.kind), 0);
            self.record(instance_id, None, None, &result).await;
            return result;
        };

        let template = self.get_template(&instance.template_id);
        let Some(handler) = template.as_ref().and_then(|t| t.handler.clone()) else {
            let err = match template {
                Some(_) => format!("{} template '{}' has no handler", self.kind, instance.template_id),
                None => PluginError::TemplateNotFound {
                    kind: self.kind,
                    id: instance.template_id.clone(),
                }
                .to_string(),
            };
            let result = ExecutionResult::failure(err, 0);
            self.record(instance_id, Some(&instance), None, &result).await;
            return result;
        };
        let name = template.map_or_else(String::new, |t| t.config.name.clone());

        let ctx = PluginContext::new(
            instance.template_id.clone(),
            name,
            instance.session_id.clone(),
            caps,
        );
        let (outcome, duration_ms) =
            invoke_guarded(handler.as_ref(), instance.params.clone(), &ctx, self.handler_timeout)
                .await;

        let result = match outcome {
            Ok(output) => ExecutionResult::from_output(output, duration_ms),
            Err(e) => {
                warn!(kind = %self.kind, instance_id, error = %e, "handler failed");
                ExecutionResult::failure(e.to_string(), duration_ms)
            }
        };
        metrics::counter!(
            "parley_plugin_executions_total",
            "kind" => self.kind.to_string(),
            "success" => result.success.to_string()
        )
        .increment(1);
        self.record(instance_id, Some(&instance), Some(&instance.params), &result)
            .await;
        result
    }

    fn touch_instance(&self, instance_id: &str) -> Option<PluginInstance> {
        let mut instances = self.instances.write();
        let instance = instances.get_mut(instance_id)?;
        instance.last_used = Utc::now();
        Some(instance.clone())
    }

    async fn record(
        &self,
        instance_id: &str,
        instance: Option<&PluginInstance>,
        params: Option<&Value>,
        result: &ExecutionResult,
    ) {
        let Some(audit) = &self.audit else { return };

        let mut entry = ExecutionLogEntry {
            executed: result.success,
            reason: result.message.clone(),
            error: result.error.clone(),
            ..ExecutionLogEntry::executed(instance_id, String::new())
        }
        .with_duration_ms(result.duration_ms)
        .with_data(json!({"params": params, "result": result.data}));
        if let Some(instance) = instance {
            entry = entry
                .with_template(instance.template_id.clone())
                .with_session(instance.session_id.as_ref().map(ToString::to_string));
        }
        append_entry(audit, entry).await;
    }

    // ── Stats ──

    /// Counters for introspection.
    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot.load();
        let mut by_event = BTreeMap::new();
        for template in snapshot.templates.values() {
            if let Some(event) = &template.config.event {
                *by_event.entry(event.clone()).or_insert(0) += 1;
            }
        }
        let template_ids = snapshot
            .templates()
            .iter()
            .map(|t| t.config.id.clone())
            .collect();
        RegistryStats {
            kind: self.kind,
            total_templates: snapshot.len(),
            enabled: snapshot.templates.values().filter(|t| t.config.enabled).count(),
            template_ids,
            total_instances: self.instance_count(),
            by_event,
            generation: snapshot.generation,
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kind", &self.kind)
            .field("dir", &self.dir)
            .field("templates", &self.snapshot.load().len())
            .field("instances", &self.instance_count())
            .finish_non_exhaustive()
    }
}

/// Append off the async runtime; failures are logged, never propagated.
pub(crate) async fn append_entry(audit: &AuditLogWriter, entry: ExecutionLogEntry) {
    let writer = audit.clone();
    let subject = entry.subject_id.clone();
    match tokio::task::spawn_blocking(move || writer.append(&entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(subject = %subject, error = %e, "failed to write audit entry"),
        Err(e) => warn!(subject = %subject, error = %e, "audit writer task failed"),
    }
}
