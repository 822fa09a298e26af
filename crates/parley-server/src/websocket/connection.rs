//! `WebSocket` client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use parley_core::{ConnectionId, Outbound, SessionId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics::WS_SEND_DROPS_TOTAL;

/// A connected `WebSocket` client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Session this client is currently subscribed to.
    session_id: Mutex<Option<SessionId>>,
    /// Send channel to the client's writer task.
    tx: mpsc::Sender<Arc<String>>,
    /// Whether the client has responded since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// Messages dropped because the channel was full or closed.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            session_id: Mutex::new(None),
            tx,
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Bind this connection to a session.
    pub fn bind_session(&self, session_id: SessionId) {
        *self.session_id.lock() = Some(session_id);
    }

    /// Clear the binding if it still points at `session_id`.
    pub fn unbind_session(&self, session_id: &SessionId) {
        let mut bound = self.session_id.lock();
        if bound.as_ref() == Some(session_id) {
            *bound = None;
        }
    }

    /// The bound session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Queue an already-encoded frame.
    ///
    /// Never blocks. Returns `false` if the channel is full or closed.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(WS_SEND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Encode and queue an outbound message.
    pub fn send_outbound(&self, message: &Outbound) -> bool {
        match message.encode() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Record a pong or other sign of life.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Read and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("session_id", &self.session_id())
            .field("dropped", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientConnection::new(ConnectionId::from("conn_1"), tx), rx)
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(8);
        assert!(conn.send(Arc::new("hello".into())));
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_closed_channel_returns_false() {
        let (conn, rx) = make_connection(8);
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.send(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_to_full_channel_returns_false() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_outbound_encodes() {
        let (conn, mut rx) = make_connection(8);
        assert!(conn.send_outbound(&Outbound::error("nope", None)));
        let parsed: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["error"], "nope");
    }

    #[test]
    fn bind_and_unbind_session() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.session_id().is_none());
        conn.bind_session(SessionId::from("s1"));
        conn.unbind_session(&SessionId::from("s2"));
        assert_eq!(conn.session_id().as_deref(), Some("s1"));
        conn.unbind_session(&SessionId::from("s1"));
        assert!(conn.session_id().is_none());
    }

    #[test]
    fn check_alive_resets_flag() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }
}
