//! # parley-settings
//!
//! Layered configuration for the Parley broker.
//!
//! Sources, lowest to highest precedence:
//! 1. Compiled defaults ([`ParleySettings::default`])
//! 2. A JSON file, deep-merged over the defaults
//! 3. `PARLEY_*` environment variables
//!
//! Settings are loaded once by the binary and handed to each component;
//! there is no process-wide instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    AuditSettings, LoggingSettings, OverflowMode, ParleySettings, PluginSettings,
    ProviderSettings, ServerSettings,
};
