use crate::{
    api::{ApiError, TeamApi},
    reconciler::{optimistic_chat, Applied, StreamReconciler},
    skills::SkillRoster,
    transport::{StreamEvent, SubscriptionTarget},
};
use fleet_core::{extract_skills, ConnectionState, SkillUpdate};
use futures_util::future::BoxFuture;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{info, warn};

const NOTICE_CAPACITY: usize = 64;

/// User-visible notifications raised by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Connection {
        target: SubscriptionTarget,
        state: ConnectionState,
    },
    SubmissionFailed {
        temp_id: String,
        reason: String,
    },
    HistoryFailed {
        target: SubscriptionTarget,
        reason: String,
    },
    SkillsChanged {
        agent_name: String,
    },
}

/// A chat message that has been appended locally and is waiting on the
/// submission request.
pub struct PendingChat {
    pub temp_id: String,
    pub submission: BoxFuture<'static, Result<(), ApiError>>,
}

/// Per-team view state: the activity log, per-agent log views, the skill
/// roster and the connection state of every subscription feeding it.
pub struct TeamSession<A: TeamApi> {
    team_id: String,
    api: Arc<A>,
    activity: StreamReconciler,
    agent_logs: HashMap<String, StreamReconciler>,
    skills: SkillRoster,
    connections: HashMap<SubscriptionTarget, ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
}

impl<A: TeamApi> TeamSession<A> {
    pub fn new(team_id: impl Into<String>, api: Arc<A>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            team_id: team_id.into(),
            api,
            activity: StreamReconciler::new(),
            agent_logs: HashMap::new(),
            skills: SkillRoster::new(),
            connections: HashMap::new(),
            notices,
        }
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn team_activity(&self) -> SubscriptionTarget {
        SubscriptionTarget::team_activity(self.team_id.clone())
    }

    pub fn agent_target(&self, agent_id: impl Into<String>) -> SubscriptionTarget {
        SubscriptionTarget::agent_logs(self.team_id.clone(), agent_id)
    }

    pub fn activity(&self) -> &StreamReconciler {
        &self.activity
    }

    pub fn agent_log(&self, agent_id: &str) -> Option<&StreamReconciler> {
        self.agent_logs.get(agent_id)
    }

    pub fn skills(&self) -> &SkillRoster {
        &self.skills
    }

    pub fn connection(&self, target: &SubscriptionTarget) -> Option<ConnectionState> {
        self.connections.get(target).copied()
    }

    /// Fetches the history for `target` and loads it. A failed fetch leaves
    /// the current view untouched and raises a notice.
    pub async fn load_history(&mut self, target: &SubscriptionTarget) -> bool {
        match self.api.fetch_logs(target).await {
            Ok(logs) => {
                info!("history_loaded: {target} ({} records)", logs.len());
                for update in logs.iter().filter_map(extract_skills) {
                    self.apply_skills(update);
                }
                self.reconciler_mut(target).load_history(logs);
                true
            }
            Err(err) => {
                warn!("history_fetch_error: {target}: {err}");
                self.notify(SessionNotice::HistoryFailed {
                    target: target.clone(),
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    /// Appends the message optimistically and hands back the submission
    /// request. Feed its outcome to [`TeamSession::complete_chat`].
    pub fn begin_chat(&mut self, text: &str) -> PendingChat {
        let temp_id = self.activity.append_optimistic(optimistic_chat(&self.team_id, text));
        PendingChat {
            temp_id,
            submission: self.api.send_chat(&self.team_id, text),
        }
    }

    /// A failure only counts while the entry is still pending. An entry the
    /// push stream already confirmed stays confirmed.
    pub fn complete_chat(&mut self, temp_id: &str, outcome: Result<(), ApiError>) {
        if let Err(err) = outcome {
            warn!("chat_submit_error: {err}");
            let reason = err.to_string();
            if !self.activity.mark_failed(temp_id, reason.clone()) {
                return;
            }
            self.notify(SessionNotice::SubmissionFailed {
                temp_id: temp_id.to_string(),
                reason,
            });
        }
    }

    /// Submits a chat message and waits for the request to finish. Returns
    /// the temporary id of the local entry.
    pub async fn send_chat(&mut self, text: &str) -> String {
        let PendingChat { temp_id, submission } = self.begin_chat(text);
        let outcome = submission.await;
        self.complete_chat(&temp_id, outcome);
        temp_id
    }

    /// Routes one event from the subscription for `target`.
    pub fn apply(&mut self, target: &SubscriptionTarget, event: StreamEvent) -> Option<Applied> {
        match event {
            StreamEvent::State(state) => {
                if self.connections.insert(target.clone(), state) != Some(state) {
                    self.notify(SessionNotice::Connection {
                        target: target.clone(),
                        state,
                    });
                }
                None
            }
            StreamEvent::Record(log) => {
                let skills = extract_skills(&log);
                let applied = self.reconciler_mut(target).append_remote(log);
                if applied != Applied::Duplicate {
                    if let Some(update) = skills {
                        self.apply_skills(update);
                    }
                }
                Some(applied)
            }
        }
    }

    fn apply_skills(&mut self, update: SkillUpdate) {
        let agent_name = update.agent_name.clone();
        if self.skills.apply(update) {
            self.notify(SessionNotice::SkillsChanged { agent_name });
        }
    }

    fn reconciler_mut(&mut self, target: &SubscriptionTarget) -> &mut StreamReconciler {
        match target.agent_id() {
            Some(agent_id) => self.agent_logs.entry(agent_id.to_string()).or_default(),
            None => &mut self.activity,
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }
}
