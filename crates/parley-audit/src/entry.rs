//! The audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One plugin execution, as written to disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// When the execution finished.
    pub timestamp: DateTime<Utc>,
    /// Listener id, action instance id or UI state id.
    pub subject_id: String,
    /// Whether the handler ran to completion and reported success.
    #[serde(alias = "success")]
    pub executed: bool,
    /// Handler-supplied reason, or a failure description.
    #[serde(alias = "message")]
    pub reason: String,
    /// Wall time of the handler call.
    #[serde(default)]
    pub duration_ms: u64,
    /// Error text when the handler failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Follow-up actions the handler reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    /// Session the execution belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Template behind an instance execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Extra payload: event payload, parameters or handler data.
    /// An explicit `null` survives a round trip as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

/// A present field is `Some`, even when it is `null`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl ExecutionLogEntry {
    /// Successful execution stamped now.
    pub fn executed(subject_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            subject_id: subject_id.into(),
            executed: true,
            reason: reason.into(),
            duration_ms: 0,
            error: None,
            actions: None,
            session_id: None,
            template_id: None,
            data: None,
        }
    }

    /// Failed execution stamped now. `reason` is prefixed with `Error: `.
    pub fn failed(subject_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            reason: format!("Error: {error}"),
            executed: false,
            error: Some(error),
            ..Self::executed(subject_id, String::new())
        }
    }

    /// Set the measured duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach the session.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Attach the template.
    #[must_use]
    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    /// Attach extra data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_entry_prefixes_reason() {
        let e = ExecutionLogEntry::failed("l1", "boom");
        assert!(!e.executed);
        assert_eq!(e.reason, "Error: boom");
        assert_eq!(e.error.as_deref(), Some("boom"));
    }

    #[test]
    fn wire_uses_camel_case_and_skips_empty() {
        let e = ExecutionLogEntry::executed("l1", "ok").with_duration_ms(12);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["subjectId"], "l1");
        assert_eq!(v["durationMs"], 12);
        assert!(v.get("error").is_none());
        assert!(v.get("sessionId").is_none());
    }

    #[test]
    fn reads_legacy_success_message_fields() {
        let e: ExecutionLogEntry = serde_json::from_value(json!({
            "timestamp": "2025-01-02T03:04:05Z",
            "subjectId": "act-1",
            "success": false,
            "message": "template missing"
        }))
        .unwrap();
        assert!(!e.executed);
        assert_eq!(e.reason, "template missing");
        assert_eq!(e.duration_ms, 0);
    }
}
