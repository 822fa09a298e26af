//! The four plugin registries, wired together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parley_audit::AuditLogWriter;
use parley_core::StateStore;
use parley_plugins::{
    HandlerCatalog, OverflowPolicy, PluginError, PluginKind, PluginRegistry, RegistryStats,
    UiStateManager, spawn_watcher,
};
use parley_settings::{OverflowMode, PluginSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Listener dispatch tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Concurrent listener invocations.
    pub concurrency: usize,
    /// Behaviour when saturated.
    pub overflow: OverflowPolicy,
    /// Per-invocation deadline.
    pub timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&PluginSettings::default())
    }
}

impl From<&PluginSettings> for DispatchSettings {
    fn from(s: &PluginSettings) -> Self {
        Self {
            concurrency: s.dispatch_concurrency,
            overflow: match s.overflow {
                OverflowMode::Wait => OverflowPolicy::Wait,
                OverflowMode::Drop => OverflowPolicy::Drop,
            },
            timeout: s.handler_timeout(),
        }
    }
}

/// Listener, Action, UI state and Component registries plus their audit
/// logs.
///
/// Each kind reads manifests from `<plugin root>/<kind dir>` and writes audit
/// entries under `<audit root>/<kind dir>`. Actions use daily partitions.
#[derive(Clone)]
pub struct PluginHost {
    listeners: Arc<PluginRegistry>,
    actions: Arc<PluginRegistry>,
    components: Arc<PluginRegistry>,
    ui_state: Arc<UiStateManager>,
    listener_audit: AuditLogWriter,
    action_audit: AuditLogWriter,
    state_audit: AuditLogWriter,
}

impl PluginHost {
    /// Build every registry and run an initial discovery, UI states first.
    pub fn load(
        plugin_root: &Path,
        audit_root: &Path,
        catalog: &Arc<HandlerCatalog>,
        store: Arc<dyn StateStore>,
        handler_timeout: Duration,
    ) -> Self {
        let listener_audit = AuditLogWriter::new(audit_root.join(PluginKind::Listener.dir_name()));
        let action_audit = AuditLogWriter::daily(audit_root.join(PluginKind::Action.dir_name()));
        let state_audit = AuditLogWriter::new(audit_root.join(PluginKind::UiState.dir_name()));

        let registry = |kind: PluginKind| {
            PluginRegistry::new(kind, plugin_root.join(kind.dir_name()), Arc::clone(catalog))
                .with_handler_timeout(handler_timeout)
        };

        let host = Self {
            listeners: Arc::new(registry(PluginKind::Listener)),
            actions: Arc::new(registry(PluginKind::Action).with_audit(action_audit.clone())),
            components: Arc::new(registry(PluginKind::Component)),
            ui_state: Arc::new(
                UiStateManager::new(Arc::new(registry(PluginKind::UiState)), store)
                    .with_audit(state_audit.clone()),
            ),
            listener_audit,
            action_audit,
            state_audit,
        };

        for kind in PluginKind::ALL {
            let loaded = host.registry(kind).discover();
            info!(%kind, loaded, "plugins loaded");
        }
        host
    }

    /// Registry for `kind`.
    pub fn registry(&self, kind: PluginKind) -> &Arc<PluginRegistry> {
        match kind {
            PluginKind::Listener => &self.listeners,
            PluginKind::Action => &self.actions,
            PluginKind::UiState => self.ui_state.registry(),
            PluginKind::Component => &self.components,
        }
    }

    /// Listener registry.
    pub fn listeners(&self) -> &Arc<PluginRegistry> {
        &self.listeners
    }

    /// Action registry.
    pub fn actions(&self) -> &Arc<PluginRegistry> {
        &self.actions
    }

    /// Component registry.
    pub fn components(&self) -> &Arc<PluginRegistry> {
        &self.components
    }

    /// UI state manager.
    pub fn ui_state(&self) -> &Arc<UiStateManager> {
        &self.ui_state
    }

    /// Audit log for `kind`. Components share the UI state log.
    pub fn audit(&self, kind: PluginKind) -> &AuditLogWriter {
        match kind {
            PluginKind::Listener => &self.listener_audit,
            PluginKind::Action => &self.action_audit,
            PluginKind::UiState | PluginKind::Component => &self.state_audit,
        }
    }

    /// Hot-reload every registry until `cancel` fires.
    pub fn spawn_watchers(
        &self,
        debounce: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, PluginError> {
        PluginKind::ALL
            .into_iter()
            .map(|kind| spawn_watcher(Arc::clone(self.registry(kind)), debounce, cancel.clone()))
            .collect()
    }

    /// Idle-instance eviction for the kinds that have instances.
    pub fn spawn_eviction(
        &self,
        ttl: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        [&self.actions, &self.components]
            .into_iter()
            .map(|r| Arc::clone(r).spawn_eviction(ttl, interval, cancel.clone()))
            .collect()
    }

    /// Drop every Action and Component instance created for `session_id`.
    pub fn remove_session_instances(&self, session_id: &str) -> usize {
        self.actions.remove_session_instances(session_id)
            + self.components.remove_session_instances(session_id)
    }

    /// Stats for every registry, in startup order.
    pub fn stats(&self) -> Vec<RegistryStats> {
        PluginKind::ALL
            .into_iter()
            .map(|kind| self.registry(kind).stats())
            .collect()
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("listeners", &self.listeners.snapshot().len())
            .field("actions", &self.actions.snapshot().len())
            .field("components", &self.components.snapshot().len())
            .finish_non_exhaustive()
    }
}
