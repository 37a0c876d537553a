use fleet_core::{ConnectionState, TaskLog};
use fleet_stream::{
    ApiError, Connector, EntryStatus, FrameStream, Origin, SessionNotice, StreamEvent,
    SubscribeOptions, SubscriptionTarget, TeamApi, TeamSession, TransportError, TransportManager,
};
use futures_util::{future::BoxFuture, stream, FutureExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Hands out one pre-wired frame feed per connect; refuses once exhausted.
#[derive(Default)]
struct FeedConnector {
    feeds: Mutex<Vec<mpsc::UnboundedReceiver<Result<String, TransportError>>>>,
}

impl FeedConnector {
    fn with_feed() -> (Self, mpsc::UnboundedSender<Result<String, TransportError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            feeds: Mutex::new(vec![rx]),
        };
        (connector, tx)
    }
}

impl Connector for FeedConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let feed = self.feeds.lock().unwrap().pop();
        let url = url.to_string();
        async move {
            let Some(rx) = feed else {
                return Err(TransportError::Connect(format!("refused: {url}")));
            };
            let frames: FrameStream =
                stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                    .boxed();
            Ok(frames)
        }
        .boxed()
    }
}

struct FakeApi {
    history: Vec<TaskLog>,
    accept_chat: bool,
}

impl TeamApi for FakeApi {
    fn fetch_logs(&self, _target: &SubscriptionTarget) -> BoxFuture<'static, Result<Vec<TaskLog>, ApiError>> {
        let history = self.history.clone();
        async move { Ok(history) }.boxed()
    }

    fn send_chat(&self, _team_id: &str, _message: &str) -> BoxFuture<'static, Result<(), ApiError>> {
        let accept = self.accept_chat;
        async move {
            if accept {
                Ok(())
            } else {
                Err(ApiError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                })
            }
        }
        .boxed()
    }
}

fn record(id: &str, from_agent: &str, message_type: &str, payload: Value) -> Value {
    json!({
        "id": id,
        "team_id": "team-a",
        "from_agent": from_agent,
        "to_agent": null,
        "message_type": message_type,
        "payload": payload,
        "created_at": "2026-02-07T21:00:00Z"
    })
}

fn history_log(id: &str) -> TaskLog {
    TaskLog::from_value(record(id, "lead", "agent_response", json!({"content": "earlier"})))
        .expect("history record")
}

fn transport(connector: FeedConnector, max_retries: u32) -> TransportManager<FeedConnector> {
    TransportManager::with_connector(
        connector,
        Url::parse("ws://hub.test/ws").expect("base url"),
        SubscribeOptions {
            max_retries,
            channel_capacity: 16,
        },
    )
}

#[tokio::test]
async fn chat_round_trip_reconciles_against_history_and_live_feed() {
    let api = Arc::new(FakeApi {
        history: vec![history_log("h1"), history_log("h2")],
        accept_chat: true,
    });
    let mut session = TeamSession::new("team-a", api);
    let target = session.team_activity();
    assert!(session.load_history(&target).await);

    let (connector, feed) = FeedConnector::with_feed();
    let transport = transport(connector, 3);
    let (subscription, mut rx) = transport.subscribe(target.clone()).expect("subscribe");

    let temp_id = session.send_chat("ship it").await;
    assert!(session.activity().awaiting_reply());

    let frames = [
        record("h2", "lead", "agent_response", json!({"content": "earlier"})).to_string(),
        record(
            "e1",
            "frontend-dev",
            "activity_event",
            json!({"type": "activity_event", "payload": {"event_type": "tool_use", "tool_name": "Bash"}}),
        )
        .to_string(),
        "{not json".to_string(),
        record("srv-1", "user", "user_message", json!({"content": "ship it"})).to_string(),
        record("r1", "lead", "agent_response", json!({"content": "shipped"})).to_string(),
    ];
    for frame in frames {
        feed.send(Ok(frame)).expect("feed open");
    }

    let mut records = 0;
    while records < 4 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("subscription open");
        if matches!(event, StreamEvent::Record(_)) {
            records += 1;
        }
        session.apply(&target, event);
    }

    let ids: Vec<&str> = session
        .activity()
        .entries()
        .map(|entry| entry.log.id.as_str())
        .collect();
    assert_eq!(ids, vec!["h1", "h2", "srv-1", "e1", "r1"]);
    assert!(session.activity().get(&temp_id).is_none());
    assert_eq!(
        session.activity().get("srv-1").map(|entry| entry.origin),
        Some(Origin::Remote)
    );
    assert!(!session.activity().awaiting_reply());
    assert_eq!(session.activity().turn().feed_len(), 0);
    assert_eq!(session.connection(&target), Some(ConnectionState::Connected));

    drop(subscription);
    while rx.recv().await.is_some() {}
}

#[tokio::test(start_paused = true)]
async fn failed_submission_and_dead_link_surface_as_notices() {
    let api = Arc::new(FakeApi {
        history: Vec::new(),
        accept_chat: false,
    });
    let mut session = TeamSession::new("team-a", api);
    let mut notices = session.notices();
    let target = session.agent_target("qa");

    let temp_id = session.send_chat("status?").await;
    let entry = session.activity().get(&temp_id).expect("entry kept");
    assert!(matches!(entry.status, EntryStatus::Failed(_)));
    assert!(matches!(
        notices.recv().await,
        Ok(SessionNotice::SubmissionFailed { .. })
    ));

    let transport = transport(FeedConnector::default(), 2);
    let (subscription, mut rx) = transport.subscribe(target.clone()).expect("subscribe");
    while let Some(event) = rx.recv().await {
        session.apply(&target, event);
    }

    assert!(!subscription.is_active());
    assert_eq!(session.connection(&target), Some(ConnectionState::Disconnected));
    let mut states = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let SessionNotice::Connection { state, .. } = notice {
            states.push(state);
        }
    }
    assert_eq!(states.first(), Some(&ConnectionState::Connecting));
    assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
    assert!(states.contains(&ConnectionState::Error));
}
