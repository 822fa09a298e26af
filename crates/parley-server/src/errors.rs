//! Gateway error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_audit::AuditError;
use parley_core::{EnvelopeError, Outbound, SessionId, StateError};
use parley_plugins::PluginError;
use serde_json::json;

/// Reply sent when routing fails for a reason the client cannot act on.
pub const GENERIC_FAILURE: &str = "Failed to process message";

/// Why an inbound message could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The frame was not a valid envelope.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Subscribe or unsubscribe named a session that does not exist.
    #[error("Session not found")]
    SessionNotFound(SessionId),
}

impl GatewayError {
    /// The `error` message sent back to the client.
    pub fn to_outbound(&self) -> Outbound {
        match self {
            Self::Envelope(EnvelopeError::UnknownType(_)) => Outbound::error(self.to_string(), None),
            Self::Envelope(EnvelopeError::Malformed(_)) => Outbound::error(GENERIC_FAILURE, None),
            Self::SessionNotFound(id) => Outbound::error(self.to_string(), Some(id.clone())),
        }
    }
}

/// Failure of an HTTP introspection request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad path or query parameter.
    #[error("{0}")]
    BadRequest(String),

    /// Nothing by that name.
    #[error("{0}")]
    NotFound(String),

    /// Server-side failure.
    #[error("{0}")]
    Internal(String),
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::InvalidSubject(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<PluginError> for ApiError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::TemplateNotFound { .. } | PluginError::InstanceNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            PluginError::State(StateError::InvalidId(_)) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
