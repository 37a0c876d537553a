//! Push subscriptions with bounded reconnect.
//!
//! Each subscription owns one [`LinkMachine`] and one driver task. The machine
//! decides what happens next; the driver only opens sockets, pumps frames and
//! waits out backoff delays.

use fleet_core::{ConnectionState, TaskLog};
use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const BASE_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("invalid push url: {0}")]
    Url(#[from] url::ParseError),
    #[error("push url cannot carry a path: {0}")]
    CannotBeABase(String),
}

/// Delay before reconnect attempt `attempt` (0-indexed).
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    TeamActivity { team_id: String },
    AgentLogs { team_id: String, agent_id: String },
}

impl SubscriptionTarget {
    pub fn team_activity(team_id: impl Into<String>) -> Self {
        SubscriptionTarget::TeamActivity {
            team_id: team_id.into(),
        }
    }

    pub fn agent_logs(team_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        SubscriptionTarget::AgentLogs {
            team_id: team_id.into(),
            agent_id: agent_id.into(),
        }
    }

    pub fn team_id(&self) -> &str {
        match self {
            SubscriptionTarget::TeamActivity { team_id }
            | SubscriptionTarget::AgentLogs { team_id, .. } => team_id,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            SubscriptionTarget::TeamActivity { .. } => None,
            SubscriptionTarget::AgentLogs { agent_id, .. } => Some(agent_id),
        }
    }

    pub fn url(&self, base: &Url) -> Result<Url, TargetError> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TargetError::CannotBeABase(base.to_string()))?;
            segments.pop_if_empty();
            match self {
                SubscriptionTarget::TeamActivity { team_id } => {
                    segments.extend(["teams", team_id.as_str(), "activity"]);
                }
                SubscriptionTarget::AgentLogs { team_id, agent_id } => {
                    segments.extend(["teams", team_id.as_str(), "logs", agent_id.as_str()]);
                }
            }
        }
        Ok(url)
    }
}

impl fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTarget::TeamActivity { team_id } => write!(f, "{team_id}/activity"),
            SubscriptionTarget::AgentLogs { team_id, agent_id } => {
                write!(f, "{team_id}/logs/{agent_id}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Closed,
    Errored,
    RetryFired,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Open,
    Close,
    RetryAfter(Duration),
    Halt,
}

/// Reconnect state machine for a single subscription.
///
/// The retry counter resets on every successful open, so only consecutive
/// failed attempts grow the delay. Once `max_retries` consecutive attempts
/// have failed the machine goes terminal.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    phase: LinkPhase,
    retries: u32,
    max_retries: u32,
}

impl LinkMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            phase: LinkPhase::Connecting,
            retries: 0,
            max_retries,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == LinkPhase::Terminal
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.phase {
            LinkPhase::Connecting => ConnectionState::Connecting,
            LinkPhase::Connected => ConnectionState::Connected,
            LinkPhase::Error => ConnectionState::Error,
            LinkPhase::Disconnected | LinkPhase::Terminal => ConnectionState::Disconnected,
        }
    }

    pub fn apply(&mut self, event: LinkEvent) -> Option<Directive> {
        match (self.phase, event) {
            (LinkPhase::Terminal, _) => None,
            (_, LinkEvent::Unsubscribed) => {
                self.phase = LinkPhase::Terminal;
                Some(Directive::Halt)
            }
            (LinkPhase::Connecting, LinkEvent::Opened) => {
                self.phase = LinkPhase::Connected;
                self.retries = 0;
                None
            }
            (LinkPhase::Connecting | LinkPhase::Connected, LinkEvent::Errored) => {
                self.phase = LinkPhase::Error;
                Some(Directive::Close)
            }
            (LinkPhase::Connecting | LinkPhase::Connected | LinkPhase::Error, LinkEvent::Closed) => {
                if self.retries >= self.max_retries {
                    self.phase = LinkPhase::Terminal;
                    return Some(Directive::Halt);
                }
                let delay = backoff_delay(self.retries);
                self.retries += 1;
                self.phase = LinkPhase::Disconnected;
                Some(Directive::RetryAfter(delay))
            }
            (LinkPhase::Disconnected, LinkEvent::RetryFired) => {
                self.phase = LinkPhase::Connecting;
                Some(Directive::Open)
            }
            _ => None,
        }
    }
}

/// Inbound text frames of one open connection. The stream ending means the
/// peer closed; an `Err` item is a transport fault.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = url.clone();
        async move {
            let ws = match connect_async(url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(err) => return Err(TransportError::Connect(err.to_string())),
            };
            let frames = ws.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Socket(err.to_string()))),
                }
            });
            let frames: FrameStream = frames.boxed();
            Ok(frames)
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub max_retries: u32,
    pub channel_capacity: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Record(TaskLog),
    State(ConnectionState),
}

/// Handle for one live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    target: SubscriptionTarget,
    cancel: Arc<watch::Sender<bool>>,
}

impl Subscription {
    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Closes the connection and cancels any pending reconnect. Repeat calls
    /// are no-ops.
    pub fn unsubscribe(&self) {
        self.cancel.send_replace(true);
    }

    /// False once unsubscribed or once the driver gave up.
    pub fn is_active(&self) -> bool {
        !*self.cancel.borrow() && !self.cancel.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Receiving half of a subscription. Once the subscription is cancelled it
/// yields nothing more, including events that were already buffered.
#[derive(Debug)]
pub struct SubscriptionEvents {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: Arc<watch::Sender<bool>>,
}

impl SubscriptionEvents {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.cancelled() {
            self.rx.close();
            return None;
        }
        let event = self.rx.recv().await?;
        if self.cancelled() {
            self.rx.close();
            return None;
        }
        Some(event)
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

pub struct TransportManager<C = WsConnector> {
    connector: Arc<C>,
    base_url: Url,
    options: SubscribeOptions,
}

impl TransportManager<WsConnector> {
    pub fn new(base_url: Url) -> Self {
        Self::with_connector(WsConnector, base_url, SubscribeOptions::default())
    }
}

impl<C: Connector> TransportManager<C> {
    pub fn with_connector(connector: C, base_url: Url, options: SubscribeOptions) -> Self {
        Self {
            connector: Arc::new(connector),
            base_url,
            options,
        }
    }

    pub fn options(&self) -> SubscribeOptions {
        self.options
    }

    pub fn subscribe(
        &self,
        target: SubscriptionTarget,
    ) -> Result<(Subscription, SubscriptionEvents), TargetError> {
        self.subscribe_with(target, self.options)
    }

    /// Starts an independent subscription. Must be called inside a tokio
    /// runtime.
    pub fn subscribe_with(
        &self,
        target: SubscriptionTarget,
        options: SubscribeOptions,
    ) -> Result<(Subscription, SubscriptionEvents), TargetError> {
        let url = target.url(&self.base_url)?;
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let (cancel, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let driver = Driver {
            connector: self.connector.clone(),
            url,
            link: LinkMachine::new(options.max_retries),
            tx,
            cancel: cancel_rx,
            reported: None,
        };
        tokio::spawn(driver.run());
        let events = SubscriptionEvents {
            rx,
            cancel: cancel.clone(),
        };
        Ok((Subscription { target, cancel }, events))
    }
}

struct Driver<C> {
    connector: Arc<C>,
    url: Url,
    link: LinkMachine,
    tx: mpsc::Sender<StreamEvent>,
    cancel: watch::Receiver<bool>,
    reported: Option<ConnectionState>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        if !self.publish_state().await {
            return;
        }
        let mut next = Some(Directive::Open);
        while let Some(directive) = next.take() {
            next = match directive {
                Directive::Open => self.open().await,
                Directive::Close => self.transition(LinkEvent::Closed).await,
                Directive::RetryAfter(delay) => self.wait(delay).await,
                Directive::Halt => None,
            };
        }
        if self.link.is_terminal() && !self.stopped() {
            warn!("ws_retries_exhausted: {}", self.url);
        }
        debug!("ws_subscription_ended: {}", self.url);
    }

    async fn open(&mut self) -> Option<Directive> {
        let attempt = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return None,
            attempt = self.connector.connect(&self.url) => attempt,
        };
        let frames = match attempt {
            Ok(frames) => frames,
            Err(err) => {
                warn!("ws_connect_error: {err}");
                return self.transition(LinkEvent::Errored).await;
            }
        };

        self.transition(LinkEvent::Opened).await;
        if self.stopped() {
            return None;
        }
        info!("ws_connected: {}", self.url);
        let outcome = self.pump(frames).await?;
        self.transition(outcome).await
    }

    /// Reads frames until the socket closes, faults or the caller cancels.
    async fn pump(&mut self, mut frames: FrameStream) -> Option<LinkEvent> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return None,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(text)) => match TaskLog::from_frame(&text) {
                    Some(log) => {
                        if !self.deliver(StreamEvent::Record(log)).await {
                            return None;
                        }
                    }
                    None => debug!("ws_frame_dropped: {} bytes", text.len()),
                },
                Some(Err(err)) => {
                    warn!("ws_read_error: {err}");
                    return Some(LinkEvent::Errored);
                }
                None => return Some(LinkEvent::Closed),
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> Option<Directive> {
        debug!(
            "ws_retry_scheduled: url={} delay_ms={} attempt={}",
            self.url,
            delay.as_millis(),
            self.link.retries()
        );
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        self.transition(LinkEvent::RetryFired).await
    }

    async fn transition(&mut self, event: LinkEvent) -> Option<Directive> {
        let directive = self.link.apply(event);
        if !self.publish_state().await {
            return None;
        }
        directive
    }

    async fn publish_state(&mut self) -> bool {
        let state = self.link.connection_state();
        if self.reported == Some(state) {
            return !self.stopped();
        }
        self.reported = Some(state);
        self.deliver(StreamEvent::State(state)).await
    }

    async fn deliver(&mut self, event: StreamEvent) -> bool {
        if self.stopped() {
            return false;
        }
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    fn stopped(&self) -> bool {
        *self.cancel.borrow() || self.tx.is_closed()
    }
}

/// Resolves once the handle asked to stop or went away.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
