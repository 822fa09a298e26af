//! Component instances resolved against their UI state.

use serde::Serialize;
use serde_json::Value;

use crate::errors::PluginError;
use crate::registry::PluginRegistry;
use crate::types::{PluginConfig, PluginInstance};
use crate::ui_state::UiStateManager;

/// Everything a client needs to render one component instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentView {
    /// The instance (props in `params`).
    pub instance: PluginInstance,
    /// Its template config.
    pub template: PluginConfig,
    /// Current value of the bound UI state.
    pub state: Option<Value>,
}

/// Resolve `instance_id` from the Component registry.
pub async fn component_view(
    components: &PluginRegistry,
    ui_state: &UiStateManager,
    instance_id: &str,
) -> Result<ComponentView, PluginError> {
    let instance = components
        .get_instance(instance_id)
        .ok_or_else(|| PluginError::InstanceNotFound(instance_id.to_owned()))?;
    let template = components.get_template(&instance.template_id).ok_or_else(|| {
        PluginError::TemplateNotFound {
            kind: components.kind(),
            id: instance.template_id.clone(),
        }
    })?;
    let state = match &template.config.state_id {
        Some(state_id) => ui_state.get_state(state_id).await?,
        None => None,
    };
    Ok(ComponentView {
        instance,
        template: template.config.clone(),
        state,
    })
}
