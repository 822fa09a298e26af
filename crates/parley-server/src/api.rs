//! HTTP API under `/api`: plugin and audit introspection, event ingress,
//! instance lifecycle and UI state administration.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use parley_audit::{AuditLogWriter, ExecutionLogEntry};
use parley_core::SessionId;
use parley_plugins::{
    ComponentView, PluginConfig, PluginInstance, PluginKind, PluginRegistry, RegistryStats,
    component_view,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::errors::ApiError;
use crate::metrics::EVENTS_INGESTED_TOTAL;
use crate::server::AppState;

/// Entries returned by the log endpoints when `limit` is absent.
const DEFAULT_LOG_LIMIT: usize = 50;

/// Routes mounted by [`ParleyServer::router`](crate::ParleyServer::router).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/plugins/{kind}", get(plugins_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/logs/{subject}", get(subject_logs_handler))
        .route("/api/events", post(events_handler))
        .route("/api/instances/{kind}", post(create_instance_handler))
        .route(
            "/api/instances/{kind}/{instance_id}",
            get(get_instance_handler).delete(delete_instance_handler),
        )
        .route("/api/components/{instance_id}", get(component_handler))
        .route("/api/state", get(list_state_handler))
        .route(
            "/api/state/{state_id}",
            get(get_state_handler).delete(delete_state_handler),
        )
}

// ── Plugins ──

/// Templates and counters of one registry.
#[derive(Debug, Serialize)]
struct PluginsResponse {
    stats: RegistryStats,
    templates: Vec<PluginConfig>,
}

fn parse_kind(kind: &str) -> Result<PluginKind, ApiError> {
    PluginKind::parse(kind).ok_or_else(|| ApiError::NotFound(format!("unknown plugin kind '{kind}'")))
}

/// GET /api/plugins/{kind}
async fn plugins_handler(
    Path(kind): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PluginsResponse>, ApiError> {
    let registry = state.gateway.plugins().registry(parse_kind(&kind)?);
    Ok(Json(PluginsResponse {
        stats: registry.stats(),
        templates: registry.templates().iter().map(|t| t.config.clone()).collect(),
    }))
}

// ── Audit logs ──

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
    /// Which registry's log; listeners when absent.
    kind: Option<String>,
}

impl LogQuery {
    fn audit(&self, state: &AppState) -> Result<AuditLogWriter, ApiError> {
        let kind = match self.kind.as_deref() {
            None => PluginKind::Listener,
            Some(s) => PluginKind::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown plugin kind '{s}'")))?,
        };
        Ok(state.gateway.plugins().audit(kind).clone())
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LOG_LIMIT)
    }
}

/// GET /api/logs
async fn logs_handler(
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionLogEntry>>, ApiError> {
    let audit = query.audit(&state)?;
    let limit = query.limit();
    read_blocking(move || audit.read_all(limit)).await
}

/// GET /api/logs/{subject}
async fn subject_logs_handler(
    Path(subject): Path<String>,
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionLogEntry>>, ApiError> {
    let audit = query.audit(&state)?;
    let limit = query.limit();
    read_blocking(move || audit.read_recent(&subject, limit)).await
}

async fn read_blocking<F>(read: F) -> Result<Json<Vec<ExecutionLogEntry>>, ApiError>
where
    F: FnOnce() -> parley_audit::Result<Vec<ExecutionLogEntry>> + Send + 'static,
{
    let entries = tokio::task::spawn_blocking(read)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(entries))
}

// ── Events ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest {
    event_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct EventAccepted {
    event: String,
    matched: usize,
    spawned: usize,
    dropped: usize,
}

/// POST /api/events
///
/// Fires the event at every matching listener and returns once the
/// invocations are started; results land in the listener audit log.
async fn events_handler(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let event = request.event_type.trim();
    if event.is_empty() {
        return Err(ApiError::BadRequest("eventType must not be empty".into()));
    }
    metrics::counter!(EVENTS_INGESTED_TOTAL).increment(1);

    let dispatch = state.gateway.check_event(event, request.data).await;
    info!(event, matched = dispatch.matched, dropped = dispatch.dropped, "event ingested");
    let accepted = EventAccepted {
        event: dispatch.event.clone(),
        matched: dispatch.matched,
        spawned: dispatch.spawned(),
        dropped: dispatch.dropped,
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// ── Instances ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceRequest {
    template_id: String,
    session_id: Option<SessionId>,
    #[serde(default)]
    params: Value,
    label: Option<String>,
}

/// Registry for a kind that has instances.
fn instance_registry(state: &AppState, kind: &str) -> Result<Arc<PluginRegistry>, ApiError> {
    let kind = parse_kind(kind)?;
    if !kind.has_instances() {
        return Err(ApiError::BadRequest(format!("{kind} plugins have no instances")));
    }
    Ok(Arc::clone(state.gateway.plugins().registry(kind)))
}

/// POST /api/instances/{kind}
async fn create_instance_handler(
    Path(kind): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<PluginInstance>), ApiError> {
    let registry = instance_registry(&state, &kind)?;
    if let Some(id) = &request.session_id {
        if state.gateway.sessions().get(id).is_none() {
            return Err(ApiError::NotFound(format!("session '{id}' not found")));
        }
    }
    let instance = registry.create_instance(
        &request.template_id,
        request.session_id,
        request.params,
        request.label,
    )?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// GET /api/instances/{kind}/{instance_id}
async fn get_instance_handler(
    Path((kind, instance_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<PluginInstance>, ApiError> {
    instance_registry(&state, &kind)?
        .get_instance(&instance_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("instance '{instance_id}' not found")))
}

/// DELETE /api/instances/{kind}/{instance_id}
async fn delete_instance_handler(
    Path((kind, instance_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if instance_registry(&state, &kind)?.remove_instance(&instance_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("instance '{instance_id}' not found")))
    }
}

/// GET /api/components/{instance_id}
async fn component_handler(
    Path(instance_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ComponentView>, ApiError> {
    let plugins = state.gateway.plugins();
    let view = component_view(plugins.components(), plugins.ui_state(), &instance_id).await?;
    Ok(Json(view))
}

// ── UI state ──

/// GET /api/state
async fn list_state_handler(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.gateway.plugins().ui_state().list_states().await?))
}

/// GET /api/state/{state_id}
async fn get_state_handler(
    Path(state_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    match state.gateway.plugins().ui_state().get_state(&state_id).await? {
        Some(data) => Ok(Json(json!({ "stateId": state_id, "data": data }))),
        None => Err(ApiError::NotFound(format!("state '{state_id}' not found"))),
    }
}

/// DELETE /api/state/{state_id}
async fn delete_state_handler(
    Path(state_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if state.gateway.plugins().ui_state().delete_state(&state_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("state '{state_id}' not found")))
    }
}
