//! End-to-end tests using a real `WebSocket` client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use futures::{SinkExt, StreamExt, stream};
use parley_core::{
    CompletionProvider, MemoryStateStore, Priority, ProviderError, ProviderEvent,
    ProviderEventStream, QueryOptions,
};
use parley_plugins::{HandlerCatalog, HandlerError, handler_fn};
use parley_server::{
    DispatchSettings, Gateway, ParleyServer, PluginHost, ServerConfig, SessionManager,
    StaticSnapshot,
};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Mock provider ──

/// Replies with a tool call, then `reply: <prompt>`, then a result.
struct ScriptedProvider;

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(
        &self,
        prompt: &str,
        options: QueryOptions,
    ) -> Result<ProviderEventStream, ProviderError> {
        let token = options.continuation_token.unwrap_or_else(|| "tok-1".into());
        let events = vec![
            Ok(ProviderEvent::Init {
                continuation_token: token,
            }),
            Ok(ProviderEvent::ToolUse {
                id: "t1".into(),
                name: "lookup".into(),
                input: json!({"q": prompt}),
            }),
            Ok(ProviderEvent::Text {
                text: format!("reply: {prompt}"),
            }),
            Ok(ProviderEvent::Result {
                success: true,
                continuation_token: None,
                cost_usd: Some(0.002),
                duration_ms: Some(12),
                error: None,
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

// ── Harness ──

fn write_manifest(root: &Path, dir: &str, manifest: &Value) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    let id = manifest["config"]["id"].as_str().unwrap();
    std::fs::write(dir.join(format!("{id}.json")), manifest.to_string()).unwrap();
}

/// A board UI state, an `alert.raised` listener and a `greet` action.
fn write_plugins(root: &Path) {
    write_manifest(
        root,
        "ui-states",
        &json!({"config": {
            "id": "board",
            "name": "Board",
            "description": "Shared task board",
            "initialState": {"tasks": []}
        }}),
    );
    write_manifest(
        root,
        "listeners",
        &json!({
            "config": {"id": "on-alert", "name": "On alert", "event": "alert.raised"},
            "handler": {"builtin": "alert"}
        }),
    );
    write_manifest(
        root,
        "actions",
        &json!({
            "config": {"id": "greet", "name": "Greet", "parameterSchema": {"type": "object"}},
            "handler": {"builtin": "greet"}
        }),
    );
}

fn catalog() -> HandlerCatalog {
    HandlerCatalog::new()
        .with(
            "alert",
            handler_fn(|input, ctx| async move {
                let Some(text) = input["text"].as_str().map(str::to_owned) else {
                    return Err(HandlerError::Failed("alert needs text".into()));
                };
                ctx.notify(text, Priority::High).await;
                Ok(json!({"executed": true, "reason": "notified"}))
            }),
        )
        .with(
            "greet",
            handler_fn(|params, _| async move {
                let who = params["who"].as_str().unwrap_or("nobody");
                Ok(json!({"message": format!("hello {who}")}))
            }),
        )
}

/// Boot a server on an ephemeral port and return its WS URL.
async fn boot_server(root: &Path, config: ServerConfig) -> (String, ParleyServer) {
    write_plugins(&root.join("plugins"));
    let plugins = PluginHost::load(
        &root.join("plugins"),
        &root.join("logs"),
        &Arc::new(catalog()),
        Arc::new(MemoryStateStore::new()),
        Duration::from_secs(5),
    );
    let gateway = Arc::new(Gateway::new(
        config,
        SessionManager::new(Arc::new(ScriptedProvider)),
        plugins,
        DispatchSettings::default(),
        Arc::new(StaticSnapshot(json!({"open": 2}))),
    ));
    let server = ParleyServer::new(gateway);
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

/// Next JSON text frame, skipping control frames.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until one of type `ty` arrives; returns every frame read.
async fn recv_until(ws: &mut WsStream, ty: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let msg = recv_json(ws).await;
        let done = msg["type"] == ty;
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Consume the three greeting frames.
async fn skip_greeting(ws: &mut WsStream) -> Value {
    let connected = recv_json(ws).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(recv_json(ws).await["type"], "snapshot");
    assert_eq!(recv_json(ws).await["type"], "uiStateTemplates");
    connected
}

/// One JSON request against the server's router.
async fn http(server: &ParleyServer, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["type"].as_str()).collect()
}

// ── Tests ──

#[tokio::test]
async fn greeting_lists_sessions_snapshot_and_templates() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;

    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["connectionId"].is_string());
    assert_eq!(connected["availableSessions"], json!([]));

    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["data"]["open"], 2);

    let templates = recv_json(&mut ws).await;
    assert_eq!(templates["templates"][0]["id"], "board");
    assert_eq!(templates["templates"][0]["description"], "Shared task board");
}

#[tokio::test]
async fn chat_streams_reply_without_tool_use() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    let _ = skip_greeting(&mut ws).await;

    send_json(&mut ws, json!({"type": "chat", "content": "hello", "sessionId": "s1"})).await;
    let frames = recv_until(&mut ws, "result").await;

    assert_eq!(types(&frames), ["sessionInfo", "message", "result"]);
    assert_eq!(frames[1]["content"], "reply: hello");
    assert_eq!(frames[2]["success"], true);
    assert_eq!(frames[2]["sessionId"], "s1");
}

#[tokio::test]
async fn late_subscriber_sees_finished_turn() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _server) = boot_server(dir.path(), ServerConfig::default()).await;

    let mut a = connect(&url).await;
    let _ = skip_greeting(&mut a).await;
    send_json(&mut a, json!({"type": "chat", "content": "first", "sessionId": "s1"})).await;
    let _ = recv_until(&mut a, "result").await;

    let mut b = connect(&url).await;
    let connected = skip_greeting(&mut b).await;
    assert_eq!(connected["availableSessions"], json!(["s1"]));

    send_json(&mut b, json!({"type": "subscribe", "sessionId": "s1"})).await;
    let info = recv_json(&mut b).await;
    assert_eq!(info["type"], "sessionInfo");
    assert_eq!(info["messageCount"], 1);
    assert_eq!(info["isActive"], false);
    assert_eq!(recv_json(&mut b).await["type"], "subscribed");

    // both subscribers receive the next turn
    send_json(&mut a, json!({"type": "chat", "content": "second", "sessionId": "s1"})).await;
    for ws in [&mut a, &mut b] {
        let frames = recv_until(ws, "result").await;
        assert!(frames.iter().any(|f| f["content"] == "reply: second"));
    }
}

#[tokio::test]
async fn subscribe_to_unknown_session_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    let _ = skip_greeting(&mut ws).await;

    send_json(&mut ws, json!({"type": "subscribe", "sessionId": "ghost"})).await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Session not found");

    send_json(&mut ws, json!({"type": "teleport"})).await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err["error"], "Unknown message type: teleport");

    // connection still usable
    send_json(&mut ws, json!({"type": "requestSnapshot"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "snapshot");
}

#[tokio::test]
async fn connections_beyond_capacity_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (url, server) = boot_server(dir.path(), config).await;

    let mut first = connect(&url).await;
    let _ = skip_greeting(&mut first).await;
    assert_eq!(server.gateway().connections().count(), 1);

    let second = timeout(TIMEOUT, connect_async(&url)).await.unwrap();
    assert!(second.is_err());
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    let _ = skip_greeting(&mut ws).await;

    server.shutdown().shutdown();
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn posted_event_notifies_connected_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    let _ = skip_greeting(&mut ws).await;

    let (status, body) = http(
        &server,
        Method::POST,
        "/api/events",
        json!({"eventType": "alert.raised", "data": {"text": "disk full"}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["matched"], 1);

    let frames = recv_until(&mut ws, "notification").await;
    let notification = frames.last().unwrap();
    assert_eq!(notification["message"], "disk full");
    assert_eq!(notification["sourceId"], "on-alert");
    assert_eq!(notification["priority"], "high");

    let log = recv_until(&mut ws, "listenerLog").await;
    assert_eq!(log.last().unwrap()["listenerId"], "on-alert");
}

#[tokio::test]
async fn created_action_instance_runs_over_websocket() {
    let dir = tempfile::tempdir().unwrap();
    let (url, server) = boot_server(dir.path(), ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    let _ = skip_greeting(&mut ws).await;

    let (status, instance) = http(
        &server,
        Method::POST,
        "/api/instances/actions",
        json!({"templateId": "greet", "params": {"who": "ada"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    send_json(
        &mut ws,
        json!({"type": "executeAction", "instanceId": instance["instanceId"]}),
    )
    .await;
    let frames = recv_until(&mut ws, "actionResult").await;
    let result = frames.last().unwrap();
    assert_eq!(result["instanceId"], instance["instanceId"]);
    assert_eq!(result["success"], true);
    assert_eq!(result["message"], "hello ada");
}
