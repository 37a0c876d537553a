use crate::{message_kind, ActivityEvent, ActivityKind, SkillStatus, TaskLog};
use serde_json::{Map, Value};

pub const EMPTY_RESULT_TEXT: &str = "Task completed with no output.";
const UNKNOWN_ERROR_TEXT: &str = "Unknown error";

/// Where the interesting fields of a payload live.
///
/// Upstream producers either put the record directly on `payload` or wrap it
/// in a bus envelope (`{ from, to, type, payload, timestamp }`), in which case
/// the record sits at `payload.payload` and the routing fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InnerRecord<'a> {
    Flat(&'a Map<String, Value>),
    Enveloped(&'a Map<String, Value>),
    Unrecognized,
}

impl<'a> InnerRecord<'a> {
    /// `is_flat` decides whether the outer object already carries the record.
    /// Otherwise a nested object at `payload` is taken as the record.
    pub fn resolve<F>(payload: &'a Value, is_flat: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> bool,
    {
        let Some(outer) = payload.as_object() else {
            return InnerRecord::Unrecognized;
        };
        if is_flat(outer) {
            return InnerRecord::Flat(outer);
        }
        match outer.get("payload") {
            Some(Value::Object(inner)) => InnerRecord::Enveloped(inner),
            _ => InnerRecord::Unrecognized,
        }
    }

    pub fn record(&self) -> Option<&'a Map<String, Value>> {
        match self {
            InnerRecord::Flat(record) | InnerRecord::Enveloped(record) => Some(record),
            InnerRecord::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillUpdate {
    pub agent_name: String,
    pub skills: Vec<SkillStatus>,
}

pub fn extract_event(log: &TaskLog) -> Option<ActivityEvent> {
    if !log.is(message_kind::ACTIVITY_EVENT) {
        return None;
    }
    let record = InnerRecord::resolve(&log.payload, |outer| {
        outer.get("event_type").is_some_and(Value::is_string)
    })
    .record()?;

    let event_type = string_field(record, "event_type")?
        .parse::<ActivityKind>()
        .ok()?;
    let agent_name = non_empty_field(record, "agent_name").unwrap_or(log.from_agent.as_str());
    let timestamp = non_empty_field(record, "timestamp").unwrap_or(log.created_at.as_str());
    if agent_name.is_empty() || timestamp.is_empty() {
        return None;
    }

    Some(ActivityEvent {
        event_type,
        agent_name: agent_name.to_string(),
        tool_name: string_field(record, "tool_name").map(str::to_string),
        action: string_field(record, "action").map(str::to_string),
        payload: record.get("payload").filter(|value| !value.is_null()).cloned(),
        timestamp: timestamp.to_string(),
    })
}

pub fn extract_skills(log: &TaskLog) -> Option<SkillUpdate> {
    if !log.is(message_kind::SKILL_STATUS) {
        return None;
    }
    let record = InnerRecord::resolve(&log.payload, |outer| {
        outer.get("skills").is_some_and(Value::is_array) || is_single_skill(outer)
    })
    .record()?;

    let skills = match record.get("skills").and_then(Value::as_array) {
        Some(entries) => entries.iter().filter_map(parse_skill).collect(),
        None if is_single_skill(record) => {
            parse_skill(&Value::Object(record.clone())).into_iter().collect()
        }
        None => return None,
    };
    let agent_name = non_empty_field(record, "agent_name")
        .unwrap_or(log.from_agent.as_str())
        .to_string();

    Some(SkillUpdate { agent_name, skills })
}

/// Plain text for a log, suitable for a chat bubble or a one-line feed row.
pub fn display_text(log: &TaskLog) -> String {
    match log.message_type.as_str() {
        message_kind::TASK_RESULT => {
            reply_text(log, &["result", "content"]).unwrap_or_else(|| EMPTY_RESULT_TEXT.to_string())
        }
        message_kind::AGENT_RESPONSE => reply_or_blank(log, &["content", "result"]),
        message_kind::USER_MESSAGE => reply_or_blank(log, &["content", "message", "text"]),
        message_kind::ERROR => error_text(log),
        message_kind::ACTIVITY_EVENT => match extract_event(log) {
            Some(event) => crate::summarize(&event),
            None => fallback_text(&log.payload),
        },
        message_kind::SKILL_STATUS => match extract_skills(log) {
            Some(update) => skills_text(&update),
            None => fallback_text(&log.payload),
        },
        _ => fallback_text(&log.payload),
    }
}

fn reply_text(log: &TaskLog, keys: &[&str]) -> Option<String> {
    match &log.payload {
        Value::String(text) => return non_empty(text),
        Value::Object(outer) => {
            if let Some(Value::String(text)) = outer.get("payload") {
                return non_empty(text);
            }
        }
        _ => {}
    }
    let record = InnerRecord::resolve(&log.payload, |outer| {
        keys.iter().any(|key| outer.contains_key(*key))
    })
    .record()?;
    keys.iter().find_map(|key| match record.get(*key) {
        Some(Value::String(text)) => non_empty(text),
        Some(Value::Null) | None => None,
        Some(other) => serde_json::to_string_pretty(other).ok(),
    })
}

/// Reply text, or "" when a reply field is present but empty. Payloads
/// without any reply field render as JSON.
fn reply_or_blank(log: &TaskLog, keys: &[&str]) -> String {
    if let Some(text) = reply_text(log, keys) {
        return text;
    }
    if has_reply_field(&log.payload, keys) {
        String::new()
    } else {
        fallback_text(&log.payload)
    }
}

fn has_reply_field(payload: &Value, keys: &[&str]) -> bool {
    match payload {
        Value::String(_) => return true,
        Value::Object(outer) if outer.get("payload").is_some_and(Value::is_string) => return true,
        _ => {}
    }
    InnerRecord::resolve(payload, |outer| keys.iter().any(|key| outer.contains_key(*key)))
        .record()
        .is_some_and(|record| keys.iter().any(|key| record.contains_key(*key)))
}

fn error_text(log: &TaskLog) -> String {
    if let Some(error) = log.error.as_deref().and_then(non_empty) {
        return error;
    }
    if let Value::String(text) = &log.payload {
        if let Some(text) = non_empty(text) {
            return text;
        }
    }
    InnerRecord::resolve(&log.payload, |outer| {
        outer.contains_key("error") || outer.contains_key("message")
    })
    .record()
    .and_then(|record| {
        non_empty_field(record, "error").or_else(|| non_empty_field(record, "message"))
    })
    .map(str::to_string)
    .unwrap_or_else(|| UNKNOWN_ERROR_TEXT.to_string())
}

fn skills_text(update: &SkillUpdate) -> String {
    if update.skills.is_empty() {
        return format!("{}: no skills", update.agent_name);
    }
    let parts: Vec<String> = update
        .skills
        .iter()
        .map(|skill| format!("{} ({})", skill.name, skill.status))
        .collect();
    format!("{}: {}", update.agent_name, parts.join(", "))
}

fn fallback_text(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn parse_skill(value: &Value) -> Option<SkillStatus> {
    serde_json::from_value(value.clone()).ok()
}

fn is_single_skill(map: &Map<String, Value>) -> bool {
    map.get("name").is_some_and(Value::is_string) && map.get("status").is_some_and(Value::is_string)
}

fn string_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn non_empty_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    string_field(map, key).filter(|value| !value.trim().is_empty())
}

fn non_empty(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
