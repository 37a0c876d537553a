pub mod api;
pub mod reconciler;
pub mod session;
pub mod skills;
pub mod transport;

pub use api::{ApiError, HttpTeamApi, TeamApi};
pub use reconciler::{
    optimistic_chat, Applied, ChatTurn, EntryStatus, LogEntry, Origin, StreamReconciler,
    ACTIVITY_LOG_CAP, TURN_FEED_CAP,
};
pub use session::{PendingChat, SessionNotice, TeamSession};
pub use skills::SkillRoster;
pub use transport::{
    backoff_delay, Connector, Directive, FrameStream, LinkEvent, LinkMachine, LinkPhase,
    StreamEvent, SubscribeOptions, Subscription, SubscriptionTarget, TargetError,
    SubscriptionEvents, TransportError, TransportManager, WsConnector, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_RETRIES,
};
