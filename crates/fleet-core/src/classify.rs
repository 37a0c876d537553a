use crate::{ActivityEvent, ActivityKind};
use serde_json::Value;
use std::fmt;

const DELEGATION_TOOL: &str = "Task";
const SUMMARY_MAX_CHARS: usize = 120;

/// Display bucket for an activity event. Presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Tool,
    Delegation,
    Thinking,
    Text,
    ToolResult,
    Error,
}

impl EventCategory {
    pub fn label(&self) -> &'static str {
        match self {
            EventCategory::Tool => "tool",
            EventCategory::Delegation => "delegate",
            EventCategory::Thinking => "thinking",
            EventCategory::Text => "text",
            EventCategory::ToolResult => "result",
            EventCategory::Error => "error",
        }
    }

    pub fn is_muted(&self) -> bool {
        matches!(self, EventCategory::Thinking | EventCategory::ToolResult)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn classify(event: &ActivityEvent) -> EventCategory {
    match event.event_type {
        ActivityKind::Error => EventCategory::Error,
        ActivityKind::ToolResult => EventCategory::ToolResult,
        ActivityKind::ToolUse => {
            if event.tool_name.as_deref() == Some(DELEGATION_TOOL) {
                EventCategory::Delegation
            } else {
                EventCategory::Tool
            }
        }
        ActivityKind::Assistant => classify_content(content_items(event)),
    }
}

/// Priority over the whole list: delegation, tool, thinking, then text.
fn classify_content(items: &[Value]) -> EventCategory {
    let has = |kind: &str| items.iter().any(|item| item_type(item) == Some(kind));
    if items.iter().any(is_delegation) {
        EventCategory::Delegation
    } else if has("tool_use") {
        EventCategory::Tool
    } else if has("thinking") {
        EventCategory::Thinking
    } else {
        EventCategory::Text
    }
}

fn is_delegation(item: &Value) -> bool {
    item_type(item) == Some("tool_use") && item_name(item) == Some(DELEGATION_TOOL)
}

/// Content blocks at `payload.message.content`, else `payload.content`.
/// The first location present wins even when it is not a list.
fn content_items(event: &ActivityEvent) -> &[Value] {
    let Some(payload) = event.payload.as_ref() else {
        return &[];
    };
    let content = payload
        .get("message")
        .and_then(|message| message.get("content"))
        .or_else(|| payload.get("content"));
    match content {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}

/// One-line description of what the event was about.
pub fn summarize(event: &ActivityEvent) -> String {
    let category = classify(event);
    let summary = match category {
        EventCategory::Error => payload_str(event, &["error", "message"])
            .or(event.action.as_deref())
            .unwrap_or("error")
            .to_string(),
        EventCategory::ToolResult => event
            .action
            .clone()
            .or_else(|| payload_str(event, &["content", "output"]).map(str::to_string))
            .unwrap_or_else(|| "tool result".to_string()),
        EventCategory::Delegation => {
            let description = delegation_description(event).or(event.action.as_deref());
            match description {
                Some(description) => format!("delegated: {description}"),
                None => "delegated a task".to_string(),
            }
        }
        EventCategory::Tool => {
            let tool = event
                .tool_name
                .as_deref()
                .or_else(|| first_item(event, "tool_use").and_then(item_name))
                .unwrap_or("tool");
            match event.action.as_deref() {
                Some(action) => format!("{tool}: {action}"),
                None => tool.to_string(),
            }
        }
        EventCategory::Thinking => first_item(event, "thinking")
            .and_then(|item| item.get("thinking").and_then(Value::as_str))
            .or(event.action.as_deref())
            .unwrap_or("thinking")
            .to_string(),
        EventCategory::Text => first_item(event, "text")
            .and_then(|item| item.get("text").and_then(Value::as_str))
            .or(event.action.as_deref())
            .unwrap_or("")
            .to_string(),
    };
    ellipsize(single_line(&summary).as_str(), SUMMARY_MAX_CHARS)
}

fn delegation_description(event: &ActivityEvent) -> Option<&str> {
    let input = match event.event_type {
        ActivityKind::ToolUse => event.payload.as_ref().and_then(|payload| payload.get("input")),
        _ => content_items(event)
            .iter()
            .find(|item| is_delegation(item))
            .and_then(|item| item.get("input")),
    }?;
    input
        .get("description")
        .or_else(|| input.get("prompt"))
        .and_then(Value::as_str)
}

fn first_item<'a>(event: &'a ActivityEvent, kind: &str) -> Option<&'a Value> {
    content_items(event)
        .iter()
        .find(|item| item_type(item) == Some(kind))
}

fn payload_str<'a>(event: &'a ActivityEvent, keys: &[&str]) -> Option<&'a str> {
    let payload = event.payload.as_ref()?;
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
}

fn item_type(item: &Value) -> Option<&str> {
    item.get("type").and_then(Value::as_str)
}

fn item_name(item: &Value) -> Option<&str> {
    item.get("name").and_then(Value::as_str)
}

fn single_line(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
