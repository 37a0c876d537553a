use crate::transport::SubscriptionTarget;
use fleet_core::TaskLog;
use futures_util::{future::BoxFuture, FutureExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("api url cannot carry a path: {0}")]
    CannotBeABase(String),
}

/// Request/response collaborator for history fetches and chat submission.
pub trait TeamApi: Send + Sync + 'static {
    fn fetch_logs(&self, target: &SubscriptionTarget) -> BoxFuture<'static, Result<Vec<TaskLog>, ApiError>>;

    fn send_chat(&self, team_id: &str, message: &str) -> BoxFuture<'static, Result<(), ApiError>>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpTeamApi {
    client: Client,
    base_url: Url,
}

impl HttpTeamApi {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::CannotBeABase(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn logs_url(&self, target: &SubscriptionTarget) -> Result<Url, ApiError> {
        match target.agent_id() {
            Some(agent_id) => self.endpoint(&["teams", target.team_id(), "logs", agent_id]),
            None => self.endpoint(&["teams", target.team_id(), "logs"]),
        }
    }
}

impl TeamApi for HttpTeamApi {
    fn fetch_logs(&self, target: &SubscriptionTarget) -> BoxFuture<'static, Result<Vec<TaskLog>, ApiError>> {
        let client = self.client.clone();
        let url = self.logs_url(target);
        async move {
            let url = url?;
            debug!("GET {url}");
            let response = client.get(url).send().await?;
            let body: Value = checked(response).await?.json().await?;
            decode_logs(body)
        }
        .boxed()
    }

    fn send_chat(&self, team_id: &str, message: &str) -> BoxFuture<'static, Result<(), ApiError>> {
        let client = self.client.clone();
        let url = self.endpoint(&["teams", team_id, "chat"]);
        let message = message.to_string();
        async move {
            let url = url?;
            debug!("POST {url}");
            let response = client
                .post(url)
                .json(&ChatRequest { message: &message })
                .send()
                .await?;
            checked(response).await?;
            Ok::<(), ApiError>(())
        }
        .boxed()
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Accepts a bare array or `{ "logs": [...] }`. Entries that are not valid
/// records are skipped.
pub fn decode_logs(body: Value) -> Result<Vec<TaskLog>, ApiError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("logs") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(ApiError::Decode("missing logs array".to_string())),
        },
        other => return Err(ApiError::Decode(format!("expected array, got {other}"))),
    };
    let total = entries.len();
    let logs: Vec<TaskLog> = entries.into_iter().filter_map(TaskLog::from_value).collect();
    if logs.len() < total {
        debug!("history_records_dropped: {}", total - logs.len());
    }
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> Value {
        json!({
            "id": id,
            "team_id": "team-a",
            "from_agent": "lead",
            "message_type": "agent_response",
            "payload": {"content": "ok"},
            "created_at": "2026-02-07T21:00:00Z"
        })
    }

    #[test]
    fn history_accepts_both_body_shapes() {
        let bare = decode_logs(json!([record("a"), record("b")])).expect("array body");
        assert_eq!(bare.len(), 2);

        let wrapped = decode_logs(json!({"logs": [record("c")]})).expect("wrapped body");
        assert_eq!(wrapped[0].id, "c");

        assert!(matches!(decode_logs(json!({"items": []})), Err(ApiError::Decode(_))));
        assert!(matches!(decode_logs(json!("nope")), Err(ApiError::Decode(_))));
    }

    #[test]
    fn invalid_history_entries_are_skipped() {
        let logs = decode_logs(json!([record("a"), {"id": "b"}, 3])).expect("body");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, "a");
    }

    #[test]
    fn endpoints_append_to_configured_base() {
        let api = HttpTeamApi::new(Url::parse("https://api.example.com/v1/").expect("url"));
        let team = SubscriptionTarget::team_activity("team-a");
        let agent = SubscriptionTarget::agent_logs("team-a", "qa");

        assert_eq!(
            api.logs_url(&team).expect("url").as_str(),
            "https://api.example.com/v1/teams/team-a/logs"
        );
        assert_eq!(
            api.logs_url(&agent).expect("url").as_str(),
            "https://api.example.com/v1/teams/team-a/logs/qa"
        );
        assert_eq!(
            api.endpoint(&["teams", "team-a", "chat"]).expect("url").as_str(),
            "https://api.example.com/v1/teams/team-a/chat"
        );
    }
}
