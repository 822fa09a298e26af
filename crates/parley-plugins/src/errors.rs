//! Plugin error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::PluginKind;

/// Registry-level failures.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No template with this id in the current snapshot.
    #[error("{kind} template '{id}' not found")]
    TemplateNotFound {
        /// Registry kind.
        kind: PluginKind,
        /// Requested template id.
        id: String,
    },

    /// No instance with this id.
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    /// A manifest could not be loaded.
    #[error("invalid manifest {path}: {message}")]
    Manifest {
        /// Manifest file.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// File watching failed to start.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Filesystem failure.
    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State store failure.
    #[error(transparent)]
    State(#[from] parley_core::StateError),
}

/// A handler invocation failed. Always caught at the dispatch boundary.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler ran past its deadline.
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// A context capability was unavailable or failed.
    #[error("capability '{capability}' failed: {message}")]
    Capability {
        /// Capability name.
        capability: &'static str,
        /// What went wrong.
        message: String,
    },

    /// Subprocess I/O.
    #[error("handler I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handler output was not valid JSON.
    #[error("handler produced invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
