use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Lifecycle states shared by supervised services (preview dev-servers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// All event kinds delivered to project subscribers.
/// Serialized adjacently tagged so the wire shape is `{type, data, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EventKind {
    /// Incremental assistant output: the new text plus the cumulative
    /// response so far.
    #[serde(rename_all = "camelCase")]
    MessageDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        delta: String,
        content: String,
    },

    /// Final assistant output for one agent run.
    #[serde(rename_all = "camelCase")]
    MessageCommit {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        content: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    /// Raw text chunk from a subprocess (non-protocol chatter, RPC
    /// control-session output).
    StreamChunk { text: String },

    /// Preview dev-server state transition.
    #[serde(rename_all = "camelCase")]
    ProcessStatus {
        status: ServiceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Operation failure surfaced to the client.
    Error { message: String },
}

/// A single event on a project channel, stamped at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ProjectEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn delta(request_id: Option<String>, delta: String, content: String) -> Self {
        Self::new(EventKind::MessageDelta {
            request_id,
            delta,
            content,
        })
    }

    pub fn commit(
        request_id: Option<String>,
        content: String,
        duration_ms: u64,
        exit_code: Option<i32>,
    ) -> Self {
        Self::new(EventKind::MessageCommit {
            request_id,
            content,
            duration_ms,
            exit_code,
        })
    }

    pub fn status(status: ServiceStatus, url: Option<String>, reason: Option<String>) -> Self {
        Self::new(EventKind::ProcessStatus {
            status,
            url,
            reason,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error {
            message: message.into(),
        })
    }

    /// Serializes the event into a text frame, sanitizing every string in
    /// the payload first. Events go out as text frames, so embedded control
    /// characters would corrupt the framing on some clients. Returns `None`
    /// (and logs) instead of raising when serialization fails; publish is
    /// best-effort by contract.
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_value(self) {
            Ok(mut value) => {
                sanitize_value(&mut value);
                Some(value.to_string())
            }
            Err(e) => {
                error!("dropping unserializable event: {}", e);
                None
            }
        }
    }
}

/// Strips control characters (other than tab/newline/carriage return) from
/// every string in the JSON tree. Rust strings cannot hold unpaired
/// surrogates, so control characters are the only remaining hazard for a
/// text frame.
fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.chars().any(is_disallowed) {
                *s = s.chars().filter(|c| !is_disallowed(*c)).collect();
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitize_value(item);
            }
        }
        _ => {}
    }
}

fn is_disallowed(c: char) -> bool {
    c.is_control() && !matches!(c, '\n' | '\r' | '\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape() {
        let event = ProjectEvent::delta(None, "Hel".into(), "Hel".into());
        let frame = event.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "message-delta");
        assert_eq!(value["data"]["delta"], "Hel");
        assert_eq!(value["data"]["content"], "Hel");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_commit_uses_camel_case_fields() {
        let event = ProjectEvent::commit(Some("req-1".into()), "done".into(), 1234, Some(0));
        let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();

        assert_eq!(value["type"], "message-commit");
        assert_eq!(value["data"]["requestId"], "req-1");
        assert_eq!(value["data"]["durationMs"], 1234);
        assert_eq!(value["data"]["exitCode"], 0);
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        let event = ProjectEvent::error("bad\u{0000}text\u{0007} but\nnewlines\tstay");
        let frame = event.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value["data"]["message"],
            "badtext but\nnewlines\tstay"
        );
    }

    #[test]
    fn test_process_status_serialization() {
        let event = ProjectEvent::status(
            ServiceStatus::Running,
            Some("http://127.0.0.1:60123".into()),
            None,
        );
        let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();

        assert_eq!(value["type"], "process-status");
        assert_eq!(value["data"]["status"], "running");
        assert_eq!(value["data"]["url"], "http://127.0.0.1:60123");
        assert!(value["data"].get("reason").is_none());
    }
}
