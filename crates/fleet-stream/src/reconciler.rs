use chrono::{SecondsFormat, Utc};
use fleet_core::{display_text, extract_event, message_kind, ActivityEvent, TaskLog};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

pub const ACTIVITY_LOG_CAP: usize = 500;
pub const TURN_FEED_CAP: usize = 50;
pub const LOCAL_SENDER: &str = "user";
const OPTIMISTIC_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    History,
    Optimistic,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub log: TaskLog,
    pub origin: Origin,
    pub status: EntryStatus,
}

impl LogEntry {
    fn is_pending_optimistic(&self) -> bool {
        self.origin == Origin::Optimistic && self.status == EntryStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Duplicate,
}

/// Builds the local placeholder for a chat message the user just sent.
pub fn optimistic_chat(team_id: &str, text: &str) -> TaskLog {
    TaskLog {
        id: String::new(),
        team_id: team_id.to_string(),
        from_agent: LOCAL_SENDER.to_string(),
        to_agent: None,
        message_type: message_kind::USER_MESSAGE.to_string(),
        payload: json!({ "content": text }),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        error: None,
    }
}

/// "Awaiting reply" flag plus the events seen since the last reply.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    awaiting_reply: bool,
    feed: VecDeque<ActivityEvent>,
    feed_cap: usize,
}

impl ChatTurn {
    pub fn new(feed_cap: usize) -> Self {
        Self {
            awaiting_reply: false,
            feed: VecDeque::new(),
            feed_cap,
        }
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn feed(&self) -> impl Iterator<Item = &ActivityEvent> {
        self.feed.iter()
    }

    pub fn feed_len(&self) -> usize {
        self.feed.len()
    }

    fn begin(&mut self) {
        self.awaiting_reply = true;
    }

    fn abandon(&mut self) {
        self.awaiting_reply = false;
    }

    fn observe(&mut self, log: &TaskLog) {
        if let Some(event) = extract_event(log) {
            self.feed.push_back(event);
            while self.feed.len() > self.feed_cap {
                self.feed.pop_front();
            }
        }

        let replied = log.is(message_kind::AGENT_RESPONSE)
            || log.is(message_kind::TASK_RESULT)
            || (log.is(message_kind::ERROR) && log.from_agent != LOCAL_SENDER);
        if replied {
            self.awaiting_reply = false;
        }
        if log.is(message_kind::AGENT_RESPONSE) {
            self.feed.clear();
        }
    }
}

/// Ordered, de-duplicated log for one session.
///
/// History keeps fetch order and is never trimmed. The live portion keeps
/// insertion order and drops its oldest entries past `live_cap`. Every id
/// stored in either portion is unique.
#[derive(Debug, Clone)]
pub struct StreamReconciler {
    history: Vec<LogEntry>,
    live: VecDeque<LogEntry>,
    ids: HashSet<String>,
    live_cap: usize,
    turn: ChatTurn,
}

impl Default for StreamReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self::with_caps(ACTIVITY_LOG_CAP, TURN_FEED_CAP)
    }

    pub fn with_caps(live_cap: usize, feed_cap: usize) -> Self {
        Self {
            history: Vec::new(),
            live: VecDeque::new(),
            ids: HashSet::new(),
            live_cap: live_cap.max(1),
            turn: ChatTurn::new(feed_cap),
        }
    }

    pub fn load_history(&mut self, records: Vec<TaskLog>) {
        let incoming: HashSet<&str> = records.iter().map(|log| log.id.as_str()).collect();
        self.live.retain(|entry| !incoming.contains(entry.log.id.as_str()));

        let mut history = Vec::with_capacity(records.len());
        let mut seen = HashSet::new();
        for log in records {
            if !seen.insert(log.id.clone()) {
                continue;
            }
            history.push(LogEntry {
                log,
                origin: Origin::History,
                status: EntryStatus::Confirmed,
            });
        }
        self.ids = seen;
        self.ids
            .extend(self.live.iter().map(|entry| entry.log.id.clone()));
        self.history = history;
    }

    /// Inserts `log` under a fresh temporary id and returns that id. A user
    /// message starts a chat turn.
    pub fn append_optimistic(&mut self, mut log: TaskLog) -> String {
        let temp_id = format!("{OPTIMISTIC_ID_PREFIX}{}", Uuid::new_v4());
        log.id = temp_id.clone();
        if log.is(message_kind::USER_MESSAGE) {
            self.turn.begin();
        }
        self.push_live(LogEntry {
            log,
            origin: Origin::Optimistic,
            status: EntryStatus::Pending,
        });
        temp_id
    }

    pub fn append_remote(&mut self, log: TaskLog) -> Applied {
        if self.ids.contains(&log.id) {
            let same_id = self
                .live
                .iter()
                .position(|entry| entry.log.id == log.id && entry.is_pending_optimistic());
            return match same_id {
                Some(pos) if same_action(&self.live[pos].log, &log) => {
                    self.confirm(pos, log);
                    Applied::Replaced
                }
                _ => Applied::Duplicate,
            };
        }

        let matching = self
            .live
            .iter()
            .position(|entry| entry.is_pending_optimistic() && same_action(&entry.log, &log));
        match matching {
            Some(pos) => {
                self.confirm(pos, log);
                Applied::Replaced
            }
            None => {
                self.turn.observe(&log);
                self.push_live(LogEntry {
                    log,
                    origin: Origin::Remote,
                    status: EntryStatus::Confirmed,
                });
                Applied::Inserted
            }
        }
    }

    /// Marks a pending optimistic entry as failed and ends the chat turn.
    /// Returns false, changing nothing, when no such entry is pending.
    pub fn mark_failed(&mut self, temp_id: &str, reason: impl Into<String>) -> bool {
        let Some(entry) = self
            .live
            .iter_mut()
            .find(|entry| entry.log.id == temp_id && entry.is_pending_optimistic())
        else {
            return false;
        };
        entry.status = EntryStatus::Failed(reason.into());
        self.turn.abandon();
        true
    }

    /// Removes an optimistic entry entirely and ends the chat turn.
    pub fn rollback(&mut self, temp_id: &str) -> Option<TaskLog> {
        let pos = self
            .live
            .iter()
            .position(|entry| entry.log.id == temp_id && entry.origin == Origin::Optimistic)?;
        let entry = self.live.remove(pos)?;
        self.ids.remove(&entry.log.id);
        self.turn.abandon();
        Some(entry.log)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter().chain(self.live.iter())
    }

    pub fn get(&self, id: &str) -> Option<&LogEntry> {
        self.entries().find(|entry| entry.log.id == id)
    }

    pub fn len(&self) -> usize {
        self.history.len() + self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn turn(&self) -> &ChatTurn {
        &self.turn
    }

    pub fn awaiting_reply(&self) -> bool {
        self.turn.awaiting_reply()
    }

    fn confirm(&mut self, pos: usize, log: TaskLog) {
        self.turn.observe(&log);
        let entry = &mut self.live[pos];
        self.ids.remove(&entry.log.id);
        self.ids.insert(log.id.clone());
        *entry = LogEntry {
            log,
            origin: Origin::Remote,
            status: EntryStatus::Confirmed,
        };
    }

    fn push_live(&mut self, entry: LogEntry) {
        self.ids.insert(entry.log.id.clone());
        self.live.push_back(entry);
        while self.live.len() > self.live_cap {
            if let Some(dropped) = self.live.pop_front() {
                self.ids.remove(&dropped.log.id);
            }
        }
    }
}

fn same_action(local: &TaskLog, remote: &TaskLog) -> bool {
    local.message_type == remote.message_type && display_text(local) == display_text(remote)
}
