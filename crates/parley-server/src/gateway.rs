//! # Gateway
//!
//! Routes inbound envelopes from every connection to sessions and plugins,
//! and owns the connection-wide background tasks: the periodic snapshot
//! push, UI state fan-out and the idle-session reaper.
//!
//! Per-session output goes through [`Session::broadcast`]; everything
//! addressed to all clients goes through [`ConnectionRegistry`]. The two
//! paths share no locks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parley_core::{ConnectionId, InstanceId, Inbound, Outbound, SessionId};
use parley_plugins::{
    Capabilities, DispatchHandle, EventDispatcher, HostCapabilities, LogObserver,
    NotificationSink, PluginKind, StateUpdate,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::conversation::{Session, SessionManager};
use crate::errors::{GENERIC_FAILURE, GatewayError};
use crate::metrics::{WS_MESSAGES_TOTAL, WS_ROUTE_PANICS_TOTAL};
use crate::plugins::{DispatchSettings, PluginHost};
use crate::snapshot::SnapshotSource;
use crate::websocket::{ClientConnection, ConnectionRegistry};

/// Greeting text in the `connected` message.
const GREETING: &str = "Connected to Parley";

/// Shared broker state behind every connection.
pub struct Gateway {
    config: ServerConfig,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
    plugins: PluginHost,
    dispatcher: EventDispatcher,
    caps: Arc<dyn Capabilities>,
    snapshot: Arc<dyn SnapshotSource>,
}

impl Gateway {
    /// Wire sessions and plugins together.
    ///
    /// Plugin notifications and listener log lines are delivered through the
    /// connection registry; `call_agent` uses the sessions' provider.
    pub fn new(
        config: ServerConfig,
        sessions: SessionManager,
        plugins: PluginHost,
        dispatch: DispatchSettings,
        snapshot: Arc<dyn SnapshotSource>,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let caps: Arc<dyn Capabilities> = Arc::new(
            HostCapabilities::new(Arc::clone(&connections) as Arc<dyn NotificationSink>)
                .with_provider(Arc::clone(sessions.provider()))
                .with_ui_state(Arc::clone(plugins.ui_state())),
        );
        let dispatcher = EventDispatcher::new(
            Arc::clone(plugins.listeners()),
            plugins.audit(PluginKind::Listener).clone(),
            Arc::clone(&caps),
        )
        .with_concurrency(dispatch.concurrency, dispatch.overflow)
        .with_timeout(dispatch.timeout)
        .with_observer(Arc::clone(&connections) as Arc<dyn LogObserver>);

        Self {
            config,
            connections,
            sessions: Arc::new(sessions),
            plugins,
            dispatcher,
            caps,
            snapshot,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open connections.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Live sessions.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Plugin registries.
    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    /// Listener dispatcher.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Fire `event` at every matching listener.
    pub async fn check_event(&self, event: &str, payload: Value) -> DispatchHandle {
        self.dispatcher.check_event(event, payload).await
    }

    // ── Connection lifecycle ──

    /// Register a new connection whose writer drains `tx`, then greet it.
    #[instrument(skip_all)]
    pub async fn on_open(&self, tx: mpsc::Sender<Arc<String>>) -> Arc<ClientConnection> {
        let conn = Arc::new(ClientConnection::new(ConnectionId::generate(), tx));
        self.connections.add(Arc::clone(&conn));
        info!(conn_id = %conn.id, total = self.connections.count(), "client connected");

        let _ = conn.send_outbound(&Outbound::Connected {
            connection_id: conn.id.clone(),
            message: GREETING.into(),
            available_sessions: self.sessions.ids(),
        });
        let _ = conn.send_outbound(&Outbound::Snapshot {
            data: self.snapshot.snapshot().await,
        });
        let _ = conn.send_outbound(&self.templates_message());
        conn
    }

    /// Handle one text frame. Never fails: every problem becomes an `error`
    /// reply on the same connection.
    #[instrument(skip_all, fields(conn_id = %conn.id))]
    pub async fn on_message(self: &Arc<Self>, conn: &Arc<ClientConnection>, text: &str) {
        metrics::counter!(WS_MESSAGES_TOTAL).increment(1);
        match AssertUnwindSafe(self.route(conn, text)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "message rejected");
                let _ = conn.send_outbound(&e.to_outbound());
            }
            Err(_) => {
                error!("panic while routing message");
                metrics::counter!(WS_ROUTE_PANICS_TOTAL).increment(1);
                let _ = conn.send_outbound(&Outbound::error(GENERIC_FAILURE, None));
            }
        }
    }

    /// Detach a closed connection and schedule its session's sweep.
    #[instrument(skip_all, fields(conn_id = %conn.id))]
    pub fn on_close(self: &Arc<Self>, conn: &Arc<ClientConnection>) {
        self.detach(conn);
        let _ = self.connections.remove(&conn.id);
        info!(
            total = self.connections.count(),
            dropped = conn.drop_count(),
            "client disconnected"
        );
    }

    // ── Routing ──

    async fn route(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        text: &str,
    ) -> Result<(), GatewayError> {
        match Inbound::parse(text)? {
            Inbound::Chat {
                content,
                session_id,
                new_conversation,
            } => self.chat(conn, content, session_id, new_conversation),
            Inbound::Subscribe { session_id } => self.subscribe(conn, session_id)?,
            Inbound::Unsubscribe { session_id } => self.unsubscribe(conn, session_id)?,
            Inbound::RequestSnapshot => {
                let data = self.snapshot.snapshot().await;
                let _ = conn.send_outbound(&Outbound::Snapshot { data });
            }
            Inbound::ExecuteAction { instance_id } => self.execute_action(conn, instance_id),
        }
        Ok(())
    }

    fn chat(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        content: String,
        session_id: Option<SessionId>,
        new_conversation: bool,
    ) {
        // a sweep can remove the session between lookup and attach; the
        // retry then creates it afresh
        let session = loop {
            let session = self.sessions.get_or_create(session_id.clone());
            if self.attach(conn, &session) {
                break session;
            }
        };
        let _ = tokio::spawn(async move {
            let summary = if new_conversation {
                session.add_message_fresh(&content).await
            } else {
                session.add_message(&content).await
            };
            debug!(session_id = %session.id(), messages = summary.messages, "chat turn done");
        });
    }

    fn subscribe(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        session_id: SessionId,
    ) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
        if !self.attach(conn, &session) {
            return Err(GatewayError::SessionNotFound(session_id));
        }
        let _ = conn.send_outbound(&Outbound::Subscribed { session_id });
        Ok(())
    }

    fn unsubscribe(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        session_id: SessionId,
    ) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
        if session.unsubscribe(conn) && session.subscriber_count() == 0 {
            self.schedule_sweep(session_id.clone());
        }
        let _ = conn.send_outbound(&Outbound::Unsubscribed { session_id });
        Ok(())
    }

    fn execute_action(self: &Arc<Self>, conn: &Arc<ClientConnection>, instance_id: InstanceId) {
        let gateway = Arc::clone(self);
        let conn = Arc::clone(conn);
        let _ = tokio::spawn(async move {
            let result = gateway
                .plugins
                .actions()
                .execute(&instance_id, Arc::clone(&gateway.caps))
                .await;
            let _ = conn.send_outbound(&Outbound::ActionResult {
                instance_id,
                success: result.success,
                message: result.message,
                data: result.data,
            });
        });
    }

    /// Move `conn` onto `session`, leaving whatever it was bound to before.
    /// Returns `false` if `session` was swept before the subscribe landed.
    fn attach(self: &Arc<Self>, conn: &Arc<ClientConnection>, session: &Arc<Session>) -> bool {
        if session.is_subscribed(&conn.id) {
            return true;
        }
        self.detach(conn);
        self.sessions.subscribe(session, conn)
    }

    fn detach(self: &Arc<Self>, conn: &Arc<ClientConnection>) {
        let Some(previous) = conn.session_id() else {
            return;
        };
        let Some(session) = self.sessions.get(&previous) else {
            return;
        };
        if session.unsubscribe(conn) && session.subscriber_count() == 0 {
            self.schedule_sweep(previous);
        }
    }

    // ── Session cleanup ──

    fn schedule_sweep(self: &Arc<Self>, session_id: SessionId) {
        let gateway = Arc::clone(self);
        let grace = self.config.session_grace_period;
        debug!(%session_id, grace_ms = grace.as_millis(), "session sweep scheduled");
        let _ = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = gateway.reap(&session_id);
        });
    }

    /// Remove `session_id` if it is still idle past the grace period.
    fn reap(&self, session_id: &str) -> bool {
        if !self
            .sessions
            .remove_if_idle(session_id, self.config.session_grace_period)
        {
            return false;
        }
        let instances = self.plugins.remove_session_instances(session_id);
        if instances > 0 {
            info!(session_id, instances, "session instances removed");
        }
        true
    }

    fn sweep_idle(&self) -> usize {
        let removed = self.sessions.sweep(self.config.session_grace_period);
        for id in &removed {
            let _ = self.plugins.remove_session_instances(id);
        }
        removed.len()
    }

    // ── Background tasks ──

    /// Start the snapshot loop, UI state fan-out and idle-session reaper.
    pub fn spawn_background(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        // subscribe before returning so no write after this call is missed
        let updates = self.plugins.ui_state().subscribe();
        vec![
            tokio::spawn(Arc::clone(self).snapshot_loop(cancel.clone())),
            tokio::spawn(Arc::clone(self).ui_state_loop(updates, cancel.clone())),
            tokio::spawn(Arc::clone(self).reaper_loop(cancel.clone())),
        ]
    }

    async fn snapshot_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.connections.count() == 0 {
                        continue;
                    }
                    let data = self.snapshot.snapshot().await;
                    let delivered = self.connections.broadcast_all(&Outbound::Snapshot { data });
                    debug!(delivered, "snapshot pushed");
                }
            }
        }
    }

    async fn ui_state_loop(
        self: Arc<Self>,
        mut updates: broadcast::Receiver<StateUpdate>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Ok(update) => {
                        let _ = self.connections.broadcast_all(&Outbound::UiStateUpdate {
                            state_id: update.state_id,
                            data: update.data,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "UI state fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn reaper_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.session_grace_period);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_idle();
                    if removed > 0 {
                        info!(removed, "idle sessions reaped");
                    }
                }
            }
        }
    }

    fn templates_message(&self) -> Outbound {
        let templates = self
            .plugins
            .ui_state()
            .list_templates()
            .iter()
            .map(|t| {
                json!({
                    "id": t.config.id,
                    "name": t.config.name,
                    "description": t.config.description,
                })
            })
            .collect();
        Outbound::UiStateTemplates { templates }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connections", &self.connections)
            .field("sessions", &self.sessions)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversation::session::tests::{EchoProvider, drain};
    use crate::plugins::tests::seeded_host;
    use crate::snapshot::StaticSnapshot;
    use std::time::Duration;

    pub(crate) fn gateway(root: &std::path::Path, config: ServerConfig) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            config,
            SessionManager::new(Arc::new(EchoProvider::default())),
            seeded_host(root),
            DispatchSettings::default(),
            Arc::new(StaticSnapshot(json!({"tickets": 3}))),
        ))
    }

    async fn open(gw: &Gateway) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        (gw.on_open(tx).await, rx)
    }

    /// Poll until `rx` yields a message of type `ty`, collecting everything seen.
    async fn wait_for(rx: &mut mpsc::Receiver<Arc<String>>, ty: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(drain(rx));
            if seen.iter().any(|m| m["type"] == ty) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no {ty} message; saw {seen:?}");
    }

    /// Wait for the session's turn to finish releasing its busy flag.
    async fn settle(gw: &Gateway, session_id: &str) {
        let session = gw.sessions().get(session_id).unwrap();
        while session.is_active() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn types(messages: &[Value]) -> Vec<&str> {
        messages.iter().filter_map(|m| m["type"].as_str()).collect()
    }

    // ── greeting ──

    #[tokio::test]
    async fn open_sends_greeting_snapshot_and_templates() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;

        let msgs = drain(&mut rx);
        assert_eq!(types(&msgs), ["connected", "snapshot", "uiStateTemplates"]);
        assert_eq!(msgs[0]["connectionId"], conn.id.as_str());
        assert_eq!(msgs[0]["availableSessions"], json!([]));
        assert_eq!(msgs[1]["data"]["tickets"], 3);
        assert_eq!(
            msgs[2]["templates"],
            json!([{"id": "board", "name": "Board", "description": "Task board"}])
        );
        assert_eq!(gw.connections().count(), 1);
    }

    // ── chat / subscribe ──

    #[tokio::test]
    async fn chat_creates_session_and_streams_reply() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        gw.on_message(&conn, r#"{"type":"chat","content":"hi","sessionId":"s1"}"#)
            .await;
        let msgs = wait_for(&mut rx, "result").await;
        assert_eq!(types(&msgs), ["sessionInfo", "message", "result"]);
        assert_eq!(msgs[1]["content"], "echo: hi");
        assert_eq!(msgs[2]["sessionId"], "s1");
        assert_eq!(conn.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn late_subscriber_gets_session_info() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (a, mut rx_a) = open(&gw).await;
        gw.on_message(&a, r#"{"type":"chat","content":"hi","sessionId":"s1"}"#)
            .await;
        let _ = wait_for(&mut rx_a, "result").await;
        settle(&gw, "s1").await;

        let (b, mut rx_b) = open(&gw).await;
        let greeting = drain(&mut rx_b);
        assert_eq!(greeting[0]["availableSessions"], json!(["s1"]));

        gw.on_message(&b, r#"{"type":"subscribe","sessionId":"s1"}"#).await;
        let msgs = drain(&mut rx_b);
        assert_eq!(types(&msgs), ["sessionInfo", "subscribed"]);
        assert_eq!(msgs[0]["messageCount"], 1);
        assert_eq!(msgs[0]["isActive"], false);
    }

    #[tokio::test]
    async fn chat_to_another_session_moves_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;
        gw.on_message(&conn, r#"{"type":"chat","content":"a","sessionId":"s1"}"#)
            .await;
        let _ = wait_for(&mut rx, "result").await;
        gw.on_message(&conn, r#"{"type":"chat","content":"b","sessionId":"s2"}"#)
            .await;
        let _ = wait_for(&mut rx, "result").await;

        assert_eq!(gw.sessions().get("s1").unwrap().subscriber_count(), 0);
        assert!(gw.sessions().get("s2").unwrap().is_subscribed(&conn.id));
    }

    #[tokio::test]
    async fn new_conversation_queued_behind_turn_starts_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let gw = Arc::new(Gateway::new(
            ServerConfig::default(),
            SessionManager::new(Arc::clone(&provider) as Arc<dyn parley_core::CompletionProvider>),
            seeded_host(dir.path()),
            DispatchSettings::default(),
            Arc::new(StaticSnapshot(json!({}))),
        ));
        let (conn, mut rx) = open(&gw).await;

        // the reset arrives while the first turn still runs
        gw.on_message(&conn, r#"{"type":"chat","content":"a","sessionId":"s1"}"#)
            .await;
        gw.on_message(
            &conn,
            r#"{"type":"chat","content":"b","sessionId":"s1","newConversation":true}"#,
        )
        .await;
        let mut results = 0;
        for _ in 0..400 {
            results += drain(&mut rx).iter().filter(|m| m["type"] == "result").count();
            if results == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(results, 2);

        assert_eq!(*provider.resumed_with.lock(), vec![None, None]);
        let session = gw.sessions().get("s1").unwrap();
        assert_eq!(session.continuation_token().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        gw.on_message(&conn, r#"{"type":"subscribe","sessionId":"nope"}"#)
            .await;
        gw.on_message(&conn, r#"{"type":"unsubscribe","sessionId":"nope"}"#)
            .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        for msg in msgs {
            assert_eq!(msg["type"], "error");
            assert_eq!(msg["error"], "Session not found");
            assert_eq!(msg["sessionId"], "nope");
        }
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        gw.on_message(&conn, "not json").await;
        gw.on_message(&conn, r#"{"type":"dance"}"#).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["error"], GENERIC_FAILURE);
        assert_eq!(msgs[1]["error"], "Unknown message type: dance");
    }

    #[tokio::test]
    async fn request_snapshot_replies_directly() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        gw.on_message(&conn, r#"{"type":"requestSnapshot"}"#).await;
        let msgs = drain(&mut rx);
        assert_eq!(types(&msgs), ["snapshot"]);
        assert!(gw.sessions().is_empty());
    }

    // ── plugins ──

    #[tokio::test]
    async fn execute_action_replies_with_result() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let instance = gw
            .plugins()
            .actions()
            .create_instance("greet", None, json!({"who": "ada"}), None)
            .unwrap();
        let (conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        let frame = json!({"type": "executeAction", "instanceId": instance.instance_id});
        gw.on_message(&conn, &frame.to_string()).await;
        let msgs = wait_for(&mut rx, "actionResult").await;
        let result = msgs.iter().find(|m| m["type"] == "actionResult").unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["message"], "hello ada");
    }

    #[tokio::test]
    async fn ui_state_writes_fan_out_to_all() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let cancel = CancellationToken::new();
        let handles = gw.spawn_background(&cancel);
        let (_a, mut rx_a) = open(&gw).await;
        let (_b, mut rx_b) = open(&gw).await;
        let _ = drain(&mut rx_a);
        let _ = drain(&mut rx_b);

        gw.plugins()
            .ui_state()
            .set_state("board", json!({"tasks": ["x"]}))
            .await
            .unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = wait_for(rx, "uiStateUpdate").await;
            let update = msgs.iter().find(|m| m["type"] == "uiStateUpdate").unwrap();
            assert_eq!(update["stateId"], "board");
            assert_eq!(update["data"]["tasks"][0], "x");
        }

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn listener_logs_reach_clients() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (_conn, mut rx) = open(&gw).await;
        let _ = drain(&mut rx);

        let entries = gw
            .check_event("report.analyzed", json!({"id": 7}))
            .await
            .join()
            .await;
        assert_eq!(entries.len(), 1);
        let msgs = wait_for(&mut rx, "listenerLog").await;
        let log = msgs.iter().find(|m| m["type"] == "listenerLog").unwrap();
        assert_eq!(log["listenerId"], "on-report");

        let on_disk = gw
            .plugins()
            .audit(PluginKind::Listener)
            .read_recent("on-report", 10)
            .unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    // ── cleanup ──

    #[tokio::test(start_paused = true)]
    async fn closed_session_swept_after_grace_with_its_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            session_grace_period: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let gw = gateway(dir.path(), config);
        let (conn, mut rx) = open(&gw).await;
        gw.on_message(&conn, r#"{"type":"chat","content":"hi","sessionId":"s1"}"#)
            .await;
        let _ = wait_for(&mut rx, "result").await;
        let _ = gw
            .plugins()
            .actions()
            .create_instance("greet", Some(SessionId::from("s1")), json!({}), None)
            .unwrap();

        gw.on_close(&conn);
        assert_eq!(gw.connections().count(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(gw.sessions().get("s1").is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(gw.sessions().get("s1").is_none());
        assert_eq!(gw.plugins().actions().instance_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribed_session_survives_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path(), ServerConfig::default());
        let (a, mut rx_a) = open(&gw).await;
        gw.on_message(&a, r#"{"type":"chat","content":"hi","sessionId":"s1"}"#)
            .await;
        let _ = wait_for(&mut rx_a, "result").await;
        gw.on_close(&a);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (b, _rx_b) = open(&gw).await;
        gw.on_message(&b, r#"{"type":"subscribe","sessionId":"s1"}"#).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(gw.sessions().get("s1").is_some());
    }
}
