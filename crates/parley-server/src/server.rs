//! `ParleyServer`: Axum HTTP + `WebSocket` front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api;
use crate::config::ServerConfig;
use crate::errors::ApiError;
use crate::gateway::Gateway;
use crate::health::{self, HealthResponse};
use crate::metrics::{WS_REJECTED_TOTAL, render};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broker state.
    pub gateway: Arc<Gateway>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Recorder handle behind `/metrics`; the route answers 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

/// The Parley server.
pub struct ParleyServer {
    gateway: Arc<Gateway>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ParleyServer {
    /// Server over `gateway`.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `handle` on `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .merge(api::routes())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    /// The task ends once the shutdown token fires and open requests finish.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = self.config();
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// Broker state.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        self.gateway.config()
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.gateway))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let config = state.gateway.config();
    let open = state.gateway.connections().count();
    if open >= config.max_connections {
        warn!(open, max = config.max_connections, "rejecting connection, at capacity");
        metrics::counter!(WS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let max_message_size = config.max_message_size;
    let gateway = Arc::clone(&state.gateway);
    let token = state.shutdown.token();
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, gateway, token))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state
        .metrics
        .ok_or_else(|| ApiError::NotFound("metrics recorder not installed".into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&handle),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::gateway;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::ServiceExt;

    fn make_server(root: &std::path::Path) -> ParleyServer {
        ParleyServer::new(gateway(root, ServerConfig::default()))
    }

    async fn get_json(server: &ParleyServer, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let (status, body) = get_json(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["plugins"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn ws_requires_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let (status, _) = get_json(&server, "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            ::metrics::counter!(WS_REJECTED_TOTAL).increment(2);
        });
        let server = make_server(dir.path()).with_metrics(handle);

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("parley_ws_rejected_total 2"), "{text}");
    }

    #[tokio::test]
    async fn metrics_endpoint_without_recorder_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let (status, body) = get_json(&server, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not installed"));
    }

    #[tokio::test]
    async fn shutdown_propagates_to_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let token = server.shutdown().token();
        server.shutdown().shutdown();
        assert!(token.is_cancelled());
    }
}
