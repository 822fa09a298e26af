//! WebSocket message envelope.
//!
//! Every frame is a JSON object tagged by `type` with camelCase fields.
//! [`Inbound`] is what clients send, [`Outbound`] is everything the broker
//! can push back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, InstanceId, SessionId};

/// Inbound `type` tags this broker understands.
const INBOUND_TYPES: &[&str] = &[
    "chat",
    "subscribe",
    "unsubscribe",
    "requestSnapshot",
    "executeAction",
];

/// Client → broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
    /// Send a user message to a session, creating it on first use.
    #[serde(rename_all = "camelCase")]
    Chat {
        /// User text.
        content: String,
        /// Target session; a fresh one is generated when absent.
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Drop the continuation token before this turn.
        #[serde(default)]
        new_conversation: bool,
    },
    /// Start receiving a session's output.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Session to join.
        session_id: SessionId,
    },
    /// Stop receiving a session's output.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Session to leave.
        session_id: SessionId,
    },
    /// Ask for the current domain snapshot.
    RequestSnapshot,
    /// Run a previously created action instance.
    #[serde(rename_all = "camelCase")]
    ExecuteAction {
        /// Instance to run.
        instance_id: InstanceId,
    },
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Frame was not a JSON object with a string `type`.
    #[error("invalid message: {0}")]
    Malformed(String),

    /// `type` names nothing this broker handles.
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl Inbound {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EnvelopeError::Malformed("missing `type`".into()))?;
        if !INBOUND_TYPES.contains(&kind) {
            return Err(EnvelopeError::UnknownType(kind.to_owned()));
        }
        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Urgency attached to a [`Notification`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Needs attention.
    High,
}

/// A message pushed by a plugin through its context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Plugin id that raised it.
    pub source_id: String,
    /// Human-readable plugin name.
    pub source_name: String,
    /// Notification text.
    pub message: String,
    /// Urgency.
    #[serde(default)]
    pub priority: Priority,
    /// Restrict delivery to connections bound to this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// When it was raised.
    pub timestamp: DateTime<Utc>,
}

/// Broker → client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    /// Greeting sent once per connection.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Id assigned to this connection.
        connection_id: ConnectionId,
        /// Greeting text.
        message: String,
        /// Sessions currently alive.
        available_sessions: Vec<SessionId>,
    },
    /// Current domain snapshot.
    Snapshot {
        /// Opaque snapshot payload.
        data: Value,
    },
    /// Assistant text produced during a turn.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Text content.
        content: String,
        /// Originating session.
        session_id: SessionId,
    },
    /// Provider tool invocation. Never delivered to end clients.
    #[serde(rename_all = "camelCase")]
    ToolUse {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
        /// Originating session.
        session_id: SessionId,
    },
    /// End of a turn.
    #[serde(rename_all = "camelCase")]
    Result {
        /// Whether the provider reported success.
        success: bool,
        /// Cost in USD, when reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        /// Wall time of the turn in milliseconds, when reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        /// Failure subtype, when unsuccessful.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Originating session.
        session_id: SessionId,
    },
    /// Session summary sent to a new subscriber.
    #[serde(rename_all = "camelCase")]
    SessionInfo {
        /// Session described.
        session_id: SessionId,
        /// Turns started so far.
        message_count: u64,
        /// A provider call is in flight.
        is_active: bool,
    },
    /// Subscribe acknowledged.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// Session joined.
        session_id: SessionId,
    },
    /// Unsubscribe acknowledged.
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        /// Session left.
        session_id: SessionId,
    },
    /// Something failed; the connection stays open.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Human-readable description.
        error: String,
        /// Session involved, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// Plugin notification.
    Notification(Notification),
    /// Live listener execution log line.
    #[serde(rename_all = "camelCase")]
    ListenerLog {
        /// Listener that ran.
        listener_id: String,
        /// The audit entry as written.
        entry: Value,
    },
    /// A UI state blob changed.
    #[serde(rename_all = "camelCase")]
    UiStateUpdate {
        /// State id.
        state_id: String,
        /// New value.
        data: Value,
    },
    /// Available UI state templates.
    UiStateTemplates {
        /// Template configs.
        templates: Vec<Value>,
    },
    /// Outcome of an `executeAction` request.
    #[serde(rename_all = "camelCase")]
    ActionResult {
        /// Instance that ran.
        instance_id: InstanceId,
        /// Whether the handler succeeded.
        success: bool,
        /// Handler message or failure reason.
        message: String,
        /// Handler payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl Outbound {
    /// Shorthand for an error frame.
    pub fn error(error: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self::Error {
            error: error.into(),
            session_id,
        }
    }

    /// Whether this message may be forwarded to end clients.
    pub fn is_client_visible(&self) -> bool {
        !matches!(self, Self::ToolUse { .. })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    // ── Inbound ──

    #[test]
    fn parse_chat_with_defaults() {
        let msg = Inbound::parse(r#"{"type":"chat","content":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Chat {
                content: "hi".into(),
                session_id: None,
                new_conversation: false,
            }
        );
    }

    #[test]
    fn parse_chat_with_session_and_reset() {
        let msg = Inbound::parse(
            r#"{"type":"chat","content":"x","sessionId":"s1","newConversation":true}"#,
        )
        .unwrap();
        assert_matches!(msg, Inbound::Chat { session_id: Some(id), new_conversation: true, .. } if id.as_str() == "s1");
    }

    #[test]
    fn parse_subscribe_and_snapshot() {
        assert_matches!(
            Inbound::parse(r#"{"type":"subscribe","sessionId":"s2"}"#).unwrap(),
            Inbound::Subscribe { session_id } if session_id.as_str() == "s2"
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"requestSnapshot"}"#).unwrap(),
            Inbound::RequestSnapshot
        );
    }

    #[test]
    fn parse_unknown_type() {
        let err = Inbound::parse(r#"{"type":"dance"}"#).unwrap_err();
        assert_matches!(err, EnvelopeError::UnknownType(t) if t == "dance");
        assert_eq!(
            Inbound::parse(r#"{"type":"dance"}"#).unwrap_err().to_string(),
            "Unknown message type: dance"
        );
    }

    #[test]
    fn parse_invalid_json_and_missing_fields() {
        assert_matches!(Inbound::parse("not json"), Err(EnvelopeError::Malformed(_)));
        assert_matches!(Inbound::parse(r#"{"content":"x"}"#), Err(EnvelopeError::Malformed(_)));
        assert_matches!(
            Inbound::parse(r#"{"type":"subscribe"}"#),
            Err(EnvelopeError::Malformed(_))
        );
    }

    // ── Outbound ──

    #[test]
    fn message_wire_shape() {
        let msg = Outbound::Message {
            content: "hello".into(),
            session_id: SessionId::from("s1"),
        };
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "message", "content": "hello", "sessionId": "s1"}));
    }

    #[test]
    fn session_info_wire_shape() {
        let msg = Outbound::SessionInfo {
            session_id: SessionId::from("s1"),
            message_count: 1,
            is_active: false,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "sessionInfo");
        assert_eq!(v["messageCount"], 1);
        assert_eq!(v["isActive"], false);
    }

    #[test]
    fn result_omits_absent_fields() {
        let msg = Outbound::Result {
            success: true,
            cost: Some(0.01),
            duration_ms: Some(1200),
            error: None,
            session_id: SessionId::from("s1"),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["durationMs"], 1200);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn error_without_session() {
        let v = serde_json::to_value(Outbound::error("Session not found", None)).unwrap();
        assert_eq!(v, json!({"type": "error", "error": "Session not found"}));
    }

    #[test]
    fn notification_is_flattened_under_tag() {
        let msg = Outbound::Notification(Notification {
            source_id: "watch".into(),
            source_name: "Watcher".into(),
            message: "price moved".into(),
            priority: Priority::High,
            session_id: None,
            timestamp: Utc::now(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "notification");
        assert_eq!(v["priority"], "high");
        assert_eq!(v["sourceId"], "watch");
    }

    #[test]
    fn tool_use_is_not_client_visible() {
        let tool = Outbound::ToolUse {
            id: "t1".into(),
            name: "search".into(),
            input: json!({}),
            session_id: SessionId::from("s1"),
        };
        assert!(!tool.is_client_visible());
        assert!(Outbound::error("x", None).is_client_visible());
    }
}
