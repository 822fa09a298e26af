//! Connection registry and the all-clients fan-out path.
//!
//! This path is independent of per-session broadcasts: it never touches a
//! session's subscriber set, and sessions never take this registry's lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use parley_audit::ExecutionLogEntry;
use parley_core::{ConnectionId, Notification, Outbound};
use parley_plugins::{LogObserver, NotificationSink};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::metrics::WS_CONNECTIONS_ACTIVE;

/// Every open connection, indexed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. An existing entry with the same id is replaced.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    }

    /// Remove a connection by id.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.write().remove(connection_id);
        if removed.is_some() {
            metrics::gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Send to every connection. Returns the number of successful enqueues.
    pub fn broadcast_all(&self, message: &Outbound) -> usize {
        let Some(json) = encode(message) else { return 0 };
        let conns = self.connections.read();
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                debug!(conn_id = %conn.id, "failed to send to client");
            }
        }
        delivered
    }

    /// Send to connections currently bound to `session_id`.
    pub fn send_to_session(&self, session_id: &str, message: &Outbound) -> usize {
        let Some(json) = encode(message) else { return 0 };
        let conns = self.connections.read();
        conns
            .values()
            .filter(|c| c.session_id().as_deref() == Some(session_id))
            .filter(|c| c.send(Arc::clone(&json)))
            .count()
    }
}

fn encode(message: &Outbound) -> Option<Arc<String>> {
    match message.encode() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode outbound message");
            None
        }
    }
}

impl NotificationSink for ConnectionRegistry {
    fn deliver(&self, notification: Notification) {
        let scope = notification.session_id.clone();
        let message = Outbound::Notification(notification);
        let delivered = match scope {
            Some(session_id) => self.send_to_session(&session_id, &message),
            None => self.broadcast_all(&message),
        };
        debug!(delivered, "notification delivered");
    }
}

impl LogObserver for ConnectionRegistry {
    fn on_entry(&self, entry: &ExecutionLogEntry) {
        match serde_json::to_value(entry) {
            Ok(value) => {
                let _ = self.broadcast_all(&Outbound::ListenerLog {
                    listener_id: entry.subject_id.clone(),
                    entry: value,
                });
            }
            Err(e) => warn!(error = %e, "failed to encode listener log entry"),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.count())
            .finish()
    }
}
