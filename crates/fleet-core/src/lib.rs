use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod classify;
pub mod envelope;

pub use classify::{classify, summarize, EventCategory};
pub use envelope::{display_text, extract_event, extract_skills, InnerRecord, SkillUpdate};

/// Well-known `message_type` tags. The tag is open; anything else passes
/// through untouched.
pub mod message_kind {
    pub const USER_MESSAGE: &str = "user_message";
    pub const AGENT_RESPONSE: &str = "agent_response";
    pub const TASK_RESULT: &str = "task_result";
    pub const ACTIVITY_EVENT: &str = "activity_event";
    pub const ERROR: &str = "error";
    pub const SKILL_STATUS: &str = "skill_status";
}

/// One message observed on the team bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLog {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub team_id: String,
    #[serde(default, deserialize_with = "deserialize_nullable_string")]
    pub from_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskLog {
    /// Decodes a single push frame. Anything that is not a JSON object with
    /// the required record fields yields `None`.
    pub fn from_frame(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn is(&self, kind: &str) -> bool {
        self.message_type == kind
    }

    /// Display-only; ordering never depends on this.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ToolUse,
    Assistant,
    ToolResult,
    Error,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ToolUse => "tool_use",
            ActivityKind::Assistant => "assistant",
            ActivityKind::ToolResult => "tool_result",
            ActivityKind::Error => "error",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "tool_use" => Ok(ActivityKind::ToolUse),
            "assistant" => Ok(ActivityKind::Assistant),
            "tool_result" => Ok(ActivityKind::ToolResult),
            "error" => Ok(ActivityKind::Error),
            other => Err(format!("Unknown event type: {other}")),
        }
    }
}

/// Normalized view of an `activity_event` log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub event_type: ActivityKind,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    Pending,
    Installed,
    Failed,
}

impl SkillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillState::Pending => "pending",
            SkillState::Installed => "installed",
            SkillState::Failed => "failed",
        }
    }
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillStatus {
    pub name: String,
    pub status: SkillState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected non-empty string or number for id")),
    }
}

fn deserialize_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_frame() -> Value {
        json!({
            "id": "log-1",
            "team_id": "team-a",
            "from_agent": "frontend-dev",
            "to_agent": null,
            "message_type": "agent_response",
            "payload": {"content": "done"},
            "created_at": "2026-02-07T21:00:00Z"
        })
    }

    #[test]
    fn frame_with_required_fields_decodes() {
        let log = TaskLog::from_frame(&valid_frame().to_string()).expect("valid log");
        assert_eq!(log.id, "log-1");
        assert_eq!(log.from_agent, "frontend-dev");
        assert_eq!(log.to_agent, None);
        assert!(log.is(message_kind::AGENT_RESPONSE));
        assert!(log.created_at_utc().is_some());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(TaskLog::from_frame("not json").is_none());
        assert!(TaskLog::from_frame("null").is_none());
        assert!(TaskLog::from_frame("[1, 2]").is_none());
        assert!(TaskLog::from_frame("\"text\"").is_none());

        for field in ["id", "team_id", "message_type", "created_at"] {
            let mut frame = valid_frame();
            frame.as_object_mut().expect("object").remove(field);
            assert!(
                TaskLog::from_frame(&frame.to_string()).is_none(),
                "frame without {field} should be dropped"
            );
        }
    }

    #[test]
    fn numeric_id_and_missing_sender_are_tolerated() {
        let mut frame = valid_frame();
        frame["id"] = json!(42);
        frame.as_object_mut().expect("object").remove("from_agent");
        let log = TaskLog::from_value(frame).expect("valid log");
        assert_eq!(log.id, "42");
        assert_eq!(log.from_agent, "");
    }

    #[test]
    fn unparseable_timestamp_is_display_only() {
        let mut frame = valid_frame();
        frame["created_at"] = json!("yesterday");
        let log = TaskLog::from_value(frame).expect("still a valid record");
        assert!(log.created_at_utc().is_none());
    }

    #[test]
    fn activity_kind_parses_known_tags_only() {
        assert_eq!("tool_use".parse::<ActivityKind>(), Ok(ActivityKind::ToolUse));
        assert_eq!("assistant".parse::<ActivityKind>(), Ok(ActivityKind::Assistant));
        assert!("system".parse::<ActivityKind>().is_err());
    }
}
