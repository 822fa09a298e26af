//! Manifest discovery.
//!
//! A plugin is one `*.json` file in its kind's directory:
//!
//! ```json
//! {
//!   "config": {"id": "price-watch", "name": "Price watch", "event": "quote.updated"},
//!   "handler": {"command": "./price_watch.py", "timeoutMs": 5000}
//! }
//! ```
//!
//! Files whose names start with `_` or `.` are ignored. A file that fails to
//! parse or validate is skipped with a warning; it never aborts the scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::PluginError;
use crate::handler::{CommandHandler, HandlerCatalog, PluginHandler};
use crate::types::{PluginConfig, PluginKind, PluginTemplate};

/// Used when a command handler does not set `timeoutMs`.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ManifestFile {
    config: PluginConfig,
    #[serde(default)]
    handler: Option<HandlerSpec>,
}

/// The `handler` block of a manifest.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HandlerSpec {
    /// In-process handler from the [`HandlerCatalog`].
    Builtin {
        /// Catalog name.
        builtin: String,
    },
    /// External program.
    #[serde(rename_all = "camelCase")]
    Command {
        /// Program path; relative paths containing a separator resolve
        /// against the manifest's directory.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Per-run timeout.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Load every manifest in `dir`, sorted by file name. Missing directories
/// yield nothing.
pub fn discover_templates(
    dir: &Path,
    kind: PluginKind,
    catalog: &HandlerCatalog,
) -> Vec<PluginTemplate> {
    let mut templates = Vec::new();
    if !dir.is_dir() {
        debug!(dir = %dir.display(), %kind, "plugin directory missing, nothing to load");
        return templates;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to read plugin directory");
            return templates;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_manifest(p))
        .collect();
    paths.sort();

    for path in paths {
        match load_manifest(&path, kind, catalog) {
            Ok(template) => {
                debug!(id = %template.config.id, %kind, path = %path.display(), "loaded plugin");
                templates.push(template);
            }
            Err(e) => warn!(path = %path.display(), %kind, error = %e, "skipping plugin"),
        }
    }
    templates
}

fn is_manifest(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.is_file()
        && !name.starts_with('_')
        && !name.starts_with('.')
        && path.extension().is_some_and(|ext| ext == "json")
}

/// Parse, validate and resolve one manifest.
pub fn load_manifest(
    path: &Path,
    kind: PluginKind,
    catalog: &HandlerCatalog,
) -> Result<PluginTemplate, PluginError> {
    let invalid = |message: String| PluginError::Manifest {
        path: path.to_path_buf(),
        message,
    };

    let content = std::fs::read_to_string(path)?;
    let manifest: ManifestFile =
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    validate_config(&manifest.config, kind).map_err(invalid)?;

    let handler = match (&manifest.handler, kind.requires_handler()) {
        (Some(spec), _) => Some(resolve_handler(spec, path, catalog).map_err(invalid)?),
        (None, true) => return Err(invalid(format!("{kind} plugins need a `handler`"))),
        (None, false) => None,
    };

    Ok(PluginTemplate {
        config: manifest.config,
        handler,
        source: path.to_path_buf(),
    })
}

fn validate_config(config: &PluginConfig, kind: PluginKind) -> Result<(), String> {
    if config.id.trim().is_empty() {
        return Err("`config.id` must not be empty".into());
    }
    if config.name.trim().is_empty() {
        return Err("`config.name` must not be empty".into());
    }
    match kind {
        PluginKind::Listener => {
            if config.event.as_deref().is_none_or(|e| e.trim().is_empty()) {
                return Err("listeners need `config.event`".into());
            }
        }
        PluginKind::Action => match &config.parameter_schema {
            Some(Value::Object(_)) => {}
            Some(_) => return Err("`config.parameterSchema` must be an object".into()),
            None => return Err("actions need `config.parameterSchema`".into()),
        },
        PluginKind::UiState => {
            if config.initial_state.is_none() {
                return Err("UI states need `config.initialState`".into());
            }
        }
        PluginKind::Component => {
            if config.state_id.as_deref().is_none_or(|s| s.trim().is_empty()) {
                return Err("components need `config.stateId`".into());
            }
        }
    }
    Ok(())
}

fn resolve_handler(
    spec: &HandlerSpec,
    manifest: &Path,
    catalog: &HandlerCatalog,
) -> Result<Arc<dyn PluginHandler>, String> {
    match spec {
        HandlerSpec::Builtin { builtin } => catalog
            .get(builtin)
            .ok_or_else(|| format!("unknown builtin handler '{builtin}'")),
        HandlerSpec::Command {
            command,
            args,
            timeout_ms,
        } => {
            let program = if command.contains('/') && Path::new(command).is_relative() {
                manifest
                    .parent()
                    .map_or_else(|| PathBuf::from(command), |dir| dir.join(command))
            } else {
                PathBuf::from(command)
            };
            let timeout = timeout_ms.map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_millis);
            Ok(Arc::new(CommandHandler::new(program, args.clone(), timeout)))
        }
    }
}
