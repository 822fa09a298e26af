//! Domain snapshot seam.
//!
//! The broker pushes an opaque JSON snapshot on connect, on
//! `requestSnapshot`, and periodically to every connection. What goes in it
//! is up to the embedding binary.

use async_trait::async_trait;
use parley_audit::AuditLogWriter;
use serde_json::{Value, json};
use tracing::warn;

/// Produces the current snapshot payload.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Build a fresh snapshot.
    async fn snapshot(&self) -> Value;
}

/// Always returns the same value.
#[derive(Clone, Debug, Default)]
pub struct StaticSnapshot(pub Value);

#[async_trait]
impl SnapshotSource for StaticSnapshot {
    async fn snapshot(&self) -> Value {
        self.0.clone()
    }
}

/// Most recent plugin executions across one audit log.
#[derive(Clone, Debug)]
pub struct RecentActivitySnapshot {
    audit: AuditLogWriter,
    limit: usize,
}

impl RecentActivitySnapshot {
    /// Snapshot of the newest `limit` entries in `audit`.
    pub fn new(audit: AuditLogWriter, limit: usize) -> Self {
        Self { audit, limit }
    }
}

#[async_trait]
impl SnapshotSource for RecentActivitySnapshot {
    async fn snapshot(&self) -> Value {
        let audit = self.audit.clone();
        let limit = self.limit;
        let entries = match tokio::task::spawn_blocking(move || audit.read_all(limit)).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read audit log for snapshot");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "snapshot read task failed");
                Vec::new()
            }
        };
        json!({
            "recentActivity": entries,
            "generatedAt": chrono::Utc::now(),
        })
    }
}
