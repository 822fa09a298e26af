//! UI state management.
//!
//! UI state templates declare a state id and its initial value. Current
//! values live in the injected [`StateStore`]; reads fall back to the
//! template's `initialState`. Every write is audited and announced on a
//! broadcast channel.

use std::sync::Arc;

use parley_audit::{AuditLogWriter, ExecutionLogEntry};
use parley_core::StateStore;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::PluginError;
use crate::registry::{PluginRegistry, append_entry};
use crate::types::{PluginKind, PluginTemplate};

/// Capacity of the update channel; slow receivers lag rather than block.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A state write.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// State id.
    pub state_id: String,
    /// New value.
    pub data: Value,
}

/// UI state templates plus their current values.
pub struct UiStateManager {
    templates: Arc<PluginRegistry>,
    store: Arc<dyn StateStore>,
    audit: Option<AuditLogWriter>,
    updates: broadcast::Sender<StateUpdate>,
}

impl UiStateManager {
    /// Manager over a [`PluginKind::UiState`] registry.
    pub fn new(templates: Arc<PluginRegistry>, store: Arc<dyn StateStore>) -> Self {
        debug_assert_eq!(templates.kind(), PluginKind::UiState);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            templates,
            store,
            audit: None,
            updates,
        }
    }

    /// Audit every write.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLogWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The template registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.templates
    }

    /// Current templates.
    pub fn list_templates(&self) -> Vec<Arc<PluginTemplate>> {
        self.templates.templates()
    }

    /// Stored value, else the template's initial state, else `None`.
    pub async fn get_state(&self, state_id: &str) -> Result<Option<Value>, PluginError> {
        if let Some(value) = self.store.get(state_id).await? {
            return Ok(Some(value));
        }
        Ok(self
            .templates
            .get_template(state_id)
            .and_then(|t| t.config.initial_state.clone()))
    }

    /// Store `data`, audit the write, and announce it.
    pub async fn set_state(&self, state_id: &str, data: Value) -> Result<(), PluginError> {
        self.store.set(state_id, data.clone()).await?;

        if let Some(audit) = &self.audit {
            let size = data.to_string().len();
            let entry = ExecutionLogEntry::executed(state_id, "set")
                .with_data(json!({"action": "set", "dataSize": size}));
            append_entry(audit, entry).await;
        }

        debug!(state_id, "ui state updated");
        // no receivers is fine
        let _ = self.updates.send(StateUpdate {
            state_id: state_id.to_owned(),
            data,
        });
        Ok(())
    }

    /// Write the template's initial state if nothing is stored yet.
    /// Returns the value now in effect.
    pub async fn initialize_if_needed(&self, state_id: &str) -> Result<Option<Value>, PluginError> {
        if let Some(value) = self.store.get(state_id).await? {
            return Ok(Some(value));
        }
        let Some(initial) = self
            .templates
            .get_template(state_id)
            .and_then(|t| t.config.initial_state.clone())
        else {
            return Ok(None);
        };
        self.set_state(state_id, initial.clone()).await?;
        Ok(Some(initial))
    }

    /// Remove a stored value. Returns whether it existed.
    pub async fn delete_state(&self, state_id: &str) -> Result<bool, PluginError> {
        Ok(self.store.delete(state_id).await?)
    }

    /// Ids with a stored value.
    pub async fn list_states(&self) -> Result<Vec<String>, PluginError> {
        Ok(self.store.list().await?)
    }

    /// Receive every subsequent write. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }
}
