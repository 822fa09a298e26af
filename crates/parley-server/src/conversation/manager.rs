//! Session map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use parley_core::{CompletionProvider, SessionId};
use tokio::time::Instant;
use tracing::info;

use super::session::Session;
use crate::metrics::SESSIONS_ACTIVE;
use crate::websocket::ClientConnection;

/// Owns every live [`Session`].
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    provider: Arc<dyn CompletionProvider>,
    system_prompt: Option<String>,
}

impl SessionManager {
    /// Empty manager; new sessions query `provider`.
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            provider,
            system_prompt: None,
        }
    }

    /// System prompt handed to every new session.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Provider shared by every session.
    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    /// Existing session `id`, or a new one. With no id a `session-<uuid>` id
    /// is generated.
    pub fn get_or_create(&self, id: Option<SessionId>) -> Arc<Session> {
        if let Some(existing) = id.as_ref().and_then(|id| self.get(id)) {
            return existing;
        }
        let id = id.unwrap_or_else(SessionId::generate);
        let mut sessions = self.sessions.write();
        // another caller may have created it between the read and the write
        Arc::clone(sessions.entry(id.clone()).or_insert_with(|| {
            info!(session_id = %id, "session created");
            metrics::gauge!(SESSIONS_ACTIVE).increment(1.0);
            Arc::new(
                Session::new(id.clone(), Arc::clone(&self.provider))
                    .with_system_prompt(self.system_prompt.clone()),
            )
        }))
    }

    /// Look up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Subscribe `conn` to `session` if it is still the live session for its
    /// id. The map lock is held across the subscribe, so a concurrent sweep
    /// either removed the session first (returns `false`) or sees it busy.
    pub fn subscribe(&self, session: &Arc<Session>, conn: &Arc<ClientConnection>) -> bool {
        let sessions = self.sessions.read();
        let live = sessions
            .get(session.id().as_str())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if live {
            session.subscribe(conn);
        }
        live
    }

    /// Ids of every live session, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Remove `id` if it has had no subscribers for at least `grace`.
    pub fn remove_if_idle(&self, id: &str, grace: Duration) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let idle = sessions
            .get(id)
            .and_then(|s| s.idle_for(now))
            .is_some_and(|idle| idle >= grace);
        if idle {
            let _ = sessions.remove(id);
            info!(session_id = id, "idle session removed");
            metrics::gauge!(SESSIONS_ACTIVE).decrement(1.0);
        }
        idle
    }

    /// Remove every session idle for at least `grace`. Returns their ids.
    pub fn sweep(&self, grace: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let idle: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for(now).is_some_and(|idle| idle >= grace))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            let _ = sessions.remove(id);
            metrics::gauge!(SESSIONS_ACTIVE).decrement(1.0);
        }
        if !idle.is_empty() {
            info!(removed = idle.len(), "idle sessions swept");
        }
        idle
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.len())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}
