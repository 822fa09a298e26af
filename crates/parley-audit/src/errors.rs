//! Audit log errors.

use thiserror::Error;

/// Errors from the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Filesystem failure.
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be serialized.
    #[error("audit log JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subject id would escape the log directory or is empty.
    #[error("invalid audit subject id: {0:?}")]
    InvalidSubject(String),
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
