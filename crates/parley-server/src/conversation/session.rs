//! One logical conversation.
//!
//! Provider calls are serialized by `query_lock`, an async mutex held for a
//! whole turn. Subscribers, the continuation token and the counters sit
//! behind a separate short `state` lock that is never held across an await,
//! so subscribing and broadcasting proceed while a turn is streaming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::{
    CompletionProvider, ConnectionId, Outbound, ProviderError, ProviderEvent, QueryOptions,
    SessionId,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{SESSION_TURN_ERRORS_TOTAL, SESSION_TURNS_TOTAL};
use crate::websocket::ClientConnection;

/// What one [`Session::add_message`] call produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    /// Outbound messages broadcast during the turn, errors included.
    pub messages: usize,
    /// Whether the provider reported success.
    pub success: bool,
    /// Provider-reported cost.
    pub cost: Option<f64>,
    /// Provider-reported duration.
    pub duration_ms: Option<u64>,
    /// Failure description, if any.
    pub error: Option<String>,
}

struct SessionState {
    subscribers: HashMap<ConnectionId, Weak<ClientConnection>>,
    continuation_token: Option<String>,
    message_count: u64,
    /// Set while there are no subscribers.
    empty_since: Option<Instant>,
}

/// A conversation with its own provider context and subscriber set.
pub struct Session {
    id: SessionId,
    provider: Arc<dyn CompletionProvider>,
    system_prompt: Option<String>,
    query_lock: tokio::sync::Mutex<()>,
    busy: AtomicBool,
    state: Mutex<SessionState>,
}

/// Clears the busy flag however the turn ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Session {
    /// New idle session with no subscribers.
    pub fn new(id: SessionId, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            id,
            provider,
            system_prompt: None,
            query_lock: tokio::sync::Mutex::new(()),
            busy: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                subscribers: HashMap::new(),
                continuation_token: None,
                message_count: 0,
                empty_since: Some(Instant::now()),
            }),
        }
    }

    /// System prompt passed on every query.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Run one turn: query the provider and broadcast its output.
    ///
    /// Concurrent callers queue on the session's query lock. Provider
    /// failures are broadcast as an `error` message and reported in the
    /// summary; they never escape.
    pub async fn add_message(&self, content: &str) -> TurnSummary {
        self.turn(content, false).await
    }

    /// Like [`add_message`](Self::add_message), but the turn starts a new
    /// conversation. The provider context is dropped once the turn holds the
    /// query lock, so a turn still in flight cannot pass its token on.
    pub async fn add_message_fresh(&self, content: &str) -> TurnSummary {
        self.turn(content, true).await
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    async fn turn(&self, content: &str, fresh: bool) -> TurnSummary {
        let _turn = self.query_lock.lock().await;
        let _busy = BusyGuard::set(&self.busy);
        let (token, turn) = {
            let mut state = self.state.lock();
            if fresh {
                state.continuation_token = None;
            }
            state.message_count += 1;
            (state.continuation_token.clone(), state.message_count)
        };
        if fresh {
            info!("conversation reset");
        }
        info!(turn, resume = token.is_some(), "turn started");
        metrics::counter!(SESSION_TURNS_TOTAL).increment(1);

        let mut summary = TurnSummary::default();
        if let Err(e) = self.run_query(content, token, &mut summary).await {
            warn!(error = %e, "query failed");
            metrics::counter!(SESSION_TURN_ERRORS_TOTAL).increment(1);
            summary.success = false;
            summary.error = Some(e.to_string());
            let error = Outbound::error(format!("Query failed: {e}"), Some(self.id.clone()));
            let _ = self.broadcast(&error);
            summary.messages += 1;
        }
        debug!(messages = summary.messages, success = summary.success, "turn finished");
        summary
    }

    async fn run_query(
        &self,
        content: &str,
        token: Option<String>,
        summary: &mut TurnSummary,
    ) -> Result<(), ProviderError> {
        let mut options = QueryOptions::new().resume(token);
        options.system_prompt.clone_from(&self.system_prompt);

        let mut stream = self.provider.query(content, options).await?;
        while let Some(event) = stream.next().await {
            let Some(message) = self.translate(event?, summary) else {
                continue;
            };
            if message.is_client_visible() {
                let _ = self.broadcast(&message);
                summary.messages += 1;
            }
        }
        Ok(())
    }

    fn translate(&self, event: ProviderEvent, summary: &mut TurnSummary) -> Option<Outbound> {
        match event {
            ProviderEvent::Init { continuation_token } => {
                debug!(token = %continuation_token, "continuation token captured");
                self.state.lock().continuation_token = Some(continuation_token);
                None
            }
            ProviderEvent::Text { text } => Some(Outbound::Message {
                content: text,
                session_id: self.id.clone(),
            }),
            ProviderEvent::ToolUse { id, name, input } => Some(Outbound::ToolUse {
                id,
                name,
                input,
                session_id: self.id.clone(),
            }),
            ProviderEvent::ToolResult { .. } => None,
            ProviderEvent::Result {
                success,
                continuation_token,
                cost_usd,
                duration_ms,
                error,
            } => {
                if let Some(token) = continuation_token {
                    self.state.lock().continuation_token = Some(token);
                }
                summary.success = success;
                summary.cost = cost_usd;
                summary.duration_ms = duration_ms;
                summary.error.clone_from(&error);
                Some(Outbound::Result {
                    success,
                    cost: cost_usd,
                    duration_ms,
                    error,
                    session_id: self.id.clone(),
                })
            }
        }
    }

    /// Add a subscriber, bind it to this session and send it `sessionInfo`.
    pub fn subscribe(&self, conn: &Arc<ClientConnection>) {
        let info = {
            let mut state = self.state.lock();
            let _ = state
                .subscribers
                .insert(conn.id.clone(), Arc::downgrade(conn));
            state.empty_since = None;
            Outbound::SessionInfo {
                session_id: self.id.clone(),
                message_count: state.message_count,
                is_active: self.busy.load(Ordering::SeqCst),
            }
        };
        conn.bind_session(self.id.clone());
        let _ = conn.send_outbound(&info);
        debug!(session_id = %self.id, conn_id = %conn.id, "subscribed");
    }

    /// Remove a subscriber. Returns whether it was subscribed.
    pub fn unsubscribe(&self, conn: &ClientConnection) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.subscribers.remove(&conn.id).is_some();
            if state.subscribers.is_empty() && state.empty_since.is_none() {
                state.empty_since = Some(Instant::now());
            }
            removed
        };
        conn.unbind_session(&self.id);
        debug!(session_id = %self.id, conn_id = %conn.id, removed, "unsubscribed");
        removed
    }

    /// Whether `conn_id` is a current subscriber.
    pub fn is_subscribed(&self, conn_id: &str) -> bool {
        self.state.lock().subscribers.contains_key(conn_id)
    }

    /// Send to every subscriber without blocking.
    ///
    /// Subscribers whose send fails, or whose connection is gone, are removed.
    /// Messages that are not client-visible are not sent. Returns the number
    /// of successful deliveries.
    pub fn broadcast(&self, message: &Outbound) -> usize {
        if !message.is_client_visible() {
            return 0;
        }
        let json = match message.encode() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<(ConnectionId, Weak<ClientConnection>)> = self
            .state
            .lock()
            .subscribers
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, conn) in targets {
            match conn.upgrade() {
                Some(conn) if conn.send(Arc::clone(&json)) => delivered += 1,
                _ => failed.push(id),
            }
        }

        if !failed.is_empty() {
            warn!(session_id = %self.id, pruned = failed.len(), "dropping unreachable subscribers");
            let mut state = self.state.lock();
            for id in &failed {
                let _ = state.subscribers.remove(id);
            }
            if state.subscribers.is_empty() && state.empty_since.is_none() {
                state.empty_since = Some(Instant::now());
            }
        }
        delivered
    }

    /// Turns started so far.
    pub fn message_count(&self) -> u64 {
        self.state.lock().message_count
    }

    /// Whether a turn is in flight.
    pub fn is_active(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Current continuation token.
    pub fn continuation_token(&self) -> Option<String> {
        self.state.lock().continuation_token.clone()
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// How long the session has had no subscribers, or `None` if it has some.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        if !state.subscribers.is_empty() {
            return None;
        }
        state
            .empty_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// The `sessionInfo` message for this session.
    pub fn info(&self) -> Outbound {
        Outbound::SessionInfo {
            session_id: self.id.clone(),
            message_count: self.message_count(),
            is_active: self.is_active(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("provider", &self.provider.name())
            .field("busy", &self.is_active())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::ProviderEventStream;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Streams a short scripted reply and tracks how many queries overlap.
    #[derive(Default)]
    pub(crate) struct EchoProvider {
        pub(crate) calls: AtomicUsize,
        pub(crate) in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) resumed_with: Mutex<Vec<Option<String>>>,
        pub(crate) fail: AtomicBool,
    }

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn query(
            &self,
            prompt: &str,
            options: QueryOptions,
        ) -> Result<ProviderEventStream, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.resumed_with.lock().push(options.continuation_token);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("offline".into()));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let prompt = prompt.to_owned();
            let stream = async_stream::stream! {
                yield Ok::<_, ProviderError>(ProviderEvent::Init { continuation_token: format!("tok-{call}") });
                yield Ok(ProviderEvent::ToolUse { id: "t1".into(), name: "search".into(), input: json!({}) });
                yield Ok(ProviderEvent::ToolResult { tool_use_id: "t1".into(), content: Value::Null, is_error: false });
                yield Ok(ProviderEvent::Text { text: format!("echo: {prompt}") });
                yield Ok(ProviderEvent::Result {
                    success: true,
                    continuation_token: None,
                    cost_usd: Some(0.01),
                    duration_ms: Some(5),
                    error: None,
                });
            };
            Ok(Box::pin(stream))
        }
    }

    pub(crate) fn connection(
        id: &str,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ClientConnection::new(ConnectionId::from(id), tx)), rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    fn session(provider: Arc<EchoProvider>) -> Session {
        Session::new(SessionId::from("s1"), provider)
    }

    // ── turns ──

    #[tokio::test]
    async fn turn_broadcasts_text_and_result_but_not_tool_use() {
        let provider = Arc::new(EchoProvider::default());
        let s = session(Arc::clone(&provider));
        let (conn, mut rx) = connection("c1", 32);
        s.subscribe(&conn);

        let summary = s.add_message("hi").await;
        assert!(summary.success);
        assert_eq!(summary.cost, Some(0.01));

        let types: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|m| m["type"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(types, vec!["sessionInfo", "message", "result"]);
        assert_eq!(s.continuation_token().as_deref(), Some("tok-1"));
        assert!(!s.is_active());
    }

    #[tokio::test]
    async fn second_turn_resumes_with_captured_token() {
        let provider = Arc::new(EchoProvider::default());
        let s = session(Arc::clone(&provider));
        let _ = s.add_message("one").await;
        let _ = s.add_message("two").await;
        assert_eq!(*provider.resumed_with.lock(), vec![None, Some("tok-1".to_owned())]);

        let _ = s.add_message_fresh("three").await;
        assert_eq!(provider.resumed_with.lock()[2], None);
        assert_eq!(s.message_count(), 3);
        assert_eq!(s.continuation_token().as_deref(), Some("tok-3"));
    }

    #[tokio::test]
    async fn fresh_turn_queued_behind_running_turn_starts_clean() {
        let provider = Arc::new(EchoProvider::default());
        let s = Arc::new(session(Arc::clone(&provider)));

        let first = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.add_message("one").await }
        });
        for _ in 0..200 {
            if s.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(s.is_active());

        // queued while "one" still holds the lock and has not captured its token
        let second = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.add_message_fresh("two").await }
        });
        assert!(first.await.unwrap().success);
        assert!(second.await.unwrap().success);

        assert_eq!(*provider.resumed_with.lock(), vec![None, None]);
        assert_eq!(s.continuation_token().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn concurrent_turns_never_overlap() {
        let provider = Arc::new(EchoProvider::default());
        let s = Arc::new(session(Arc::clone(&provider)));

        let turns: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.add_message(&format!("m{i}")).await })
            })
            .collect();
        for t in turns {
            assert!(t.await.unwrap().success);
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(s.message_count(), 8);
        assert!(!s.is_active());
    }

    #[tokio::test]
    async fn provider_failure_is_broadcast_and_session_recovers() {
        let provider = Arc::new(EchoProvider::default());
        provider.fail.store(true, Ordering::SeqCst);
        let s = session(Arc::clone(&provider));
        let (conn, mut rx) = connection("c1", 32);
        s.subscribe(&conn);

        let summary = s.add_message("hi").await;
        assert!(!summary.success);
        let msgs = drain(&mut rx);
        let last = msgs.last().unwrap();
        assert_eq!(last["type"], "error");
        assert!(last["error"].as_str().unwrap().starts_with("Query failed: "));
        assert_eq!(last["sessionId"], "s1");
        assert!(!s.is_active());

        provider.fail.store(false, Ordering::SeqCst);
        assert!(s.add_message("again").await.success);
    }

    // ── subscribers ──

    #[tokio::test]
    async fn late_subscriber_sees_completed_turn() {
        let s = session(Arc::new(EchoProvider::default()));
        let _ = s.add_message("hi").await;

        let (late, mut rx) = connection("late", 8);
        s.subscribe(&late);
        let info = &drain(&mut rx)[0];
        assert_eq!(info["type"], "sessionInfo");
        assert_eq!(info["messageCount"], 1);
        assert_eq!(info["isActive"], false);
        assert_eq!(late.session_id().as_deref(), Some("s1"));
    }

    #[test]
    fn broadcast_prunes_failed_subscribers() {
        let s = session(Arc::new(EchoProvider::default()));
        let k = 6;
        let m = 2;
        let mut receivers = Vec::new();
        let mut conns = Vec::new();
        for i in 0..k {
            let (conn, rx) = connection(&format!("c{i}"), 8);
            s.subscribe(&conn);
            if i < m {
                drop(rx);
            } else {
                receivers.push(rx);
            }
            conns.push(conn);
        }
        assert_eq!(s.subscriber_count(), k);

        let msg = Outbound::Message {
            content: "x".into(),
            session_id: SessionId::from("s1"),
        };
        assert_eq!(s.broadcast(&msg), k - m);
        assert_eq!(s.subscriber_count(), k - m);
    }

    #[test]
    fn dropped_connection_is_pruned() {
        let s = session(Arc::new(EchoProvider::default()));
        let (conn, _rx) = connection("gone", 8);
        s.subscribe(&conn);
        drop(conn);
        let msg = Outbound::Snapshot { data: Value::Null };
        assert_eq!(s.broadcast(&msg), 0);
        assert_eq!(s.subscriber_count(), 0);
    }

    #[test]
    fn tool_use_is_never_broadcast() {
        let s = session(Arc::new(EchoProvider::default()));
        let (conn, mut rx) = connection("c1", 8);
        s.subscribe(&conn);
        let _ = drain(&mut rx);
        let tool = Outbound::ToolUse {
            id: "t".into(),
            name: "n".into(),
            input: Value::Null,
            session_id: SessionId::from("s1"),
        };
        assert_eq!(s.broadcast(&tool), 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(s.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_starts_when_last_subscriber_leaves() {
        let s = session(Arc::new(EchoProvider::default()));
        let (conn, _rx) = connection("c1", 8);
        s.subscribe(&conn);
        assert_eq!(s.idle_for(Instant::now()), None);

        assert!(s.unsubscribe(&conn));
        assert!(conn.session_id().is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(s.idle_for(Instant::now()), Some(Duration::from_secs(5)));
    }
}
