//! # parley-plugins
//!
//! Plugin registries for the Parley broker.
//!
//! Four kinds share one registry implementation ([`PluginRegistry`]):
//!
//! - **Listener**: reacts to named events via [`EventDispatcher::check_event`]
//! - **Action**: instantiated with parameters, executed on request
//! - **UI state**: named JSON state with an initial value ([`UiStateManager`])
//! - **Component**: binds a view to a UI state
//!
//! Templates are loaded from JSON manifests, swapped atomically on reload,
//! and every handler invocation is isolated and audited.

#![deny(unsafe_code)]

pub mod components;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod manifest;
pub mod registry;
pub mod types;
pub mod ui_state;
pub mod watcher;

pub use components::{ComponentView, component_view};
pub use context::{Capabilities, HostCapabilities, LogLevel, NotificationSink, PluginContext};
pub use dispatcher::{DispatchHandle, EventDispatcher, LogObserver, OverflowPolicy};
pub use errors::{HandlerError, PluginError};
pub use handler::{CommandHandler, HandlerCatalog, PluginHandler, handler_fn};
pub use registry::{PluginRegistry, RegistrySnapshot};
pub use types::{
    ExecutionResult, ListenerResult, PluginConfig, PluginInstance, PluginKind, PluginTemplate,
    RegistryStats,
};
pub use ui_state::{StateUpdate, UiStateManager};
pub use watcher::spawn_watcher;
