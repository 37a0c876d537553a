use anyhow::{bail, Context, Result};
use clap::Parser;
use fleet_core::{classify, display_text, extract_event, summarize, TaskLog};
use fleet_stream::{
    Applied, ApiError, HttpTeamApi, LogEntry, PendingChat, SessionNotice, StreamEvent,
    SubscribeOptions, TeamSession, TransportManager, WsConnector, DEFAULT_MAX_RETRIES,
};
use std::{env, io, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

#[derive(Parser, Debug)]
#[command(name = "fleet-tail")]
#[command(about = "Tail a team's live activity feed", long_about = None)]
struct Args {
    /// Team to follow (falls back to FLEET_TEAM_ID)
    #[arg(long, default_value = "")]
    team: String,
    /// Follow one agent's log stream instead of the team activity feed
    #[arg(long)]
    agent: Option<String>,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Send a chat message to the team once connected
    #[arg(long)]
    message: Option<String>,
    #[arg(long)]
    no_history: bool,
    /// Also print thinking and tool result events
    #[arg(long)]
    show_muted: bool,
}

#[derive(Debug)]
struct TailConfig {
    team_id: String,
    agent_id: Option<String>,
    api_url: Url,
    ws_url: Url,
    max_retries: u32,
    message: Option<String>,
    load_history: bool,
    show_muted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let config = load_config(Args::parse())?;
    info!(
        "fleet_tail_start: team={} api={} ws={}",
        config.team_id, config.api_url, config.ws_url
    );
    run(config).await
}

fn load_config(args: Args) -> Result<TailConfig> {
    let team_id = resolve_team_id(&args.team)?;
    let api_url = resolve_api_url(&args.api_url)?;
    let ws_url = resolve_ws_url(&args.ws_url, &api_url)?;
    let max_retries = resolve_max_retries(args.max_retries);
    Ok(TailConfig {
        team_id,
        agent_id: args.agent.filter(|agent| !agent.trim().is_empty()),
        api_url,
        ws_url,
        max_retries,
        message: args.message.filter(|message| !message.trim().is_empty()),
        load_history: !args.no_history,
        show_muted: args.show_muted,
    })
}

async fn run(config: TailConfig) -> Result<()> {
    let api = Arc::new(HttpTeamApi::new(config.api_url.clone()));
    let mut session = TeamSession::new(config.team_id.clone(), api);
    let mut notices = session.notices();
    let target = match &config.agent_id {
        Some(agent_id) => session.agent_target(agent_id.clone()),
        None => session.team_activity(),
    };

    if config.load_history && session.load_history(&target).await {
        let entries: Vec<&LogEntry> = match &config.agent_id {
            Some(agent_id) => session
                .agent_log(agent_id)
                .map(|log| log.entries().collect())
                .unwrap_or_default(),
            None => session.activity().entries().collect(),
        };
        for entry in entries {
            print_log(&entry.log, config.show_muted);
        }
    }

    let transport = TransportManager::with_connector(
        WsConnector,
        config.ws_url.clone(),
        SubscribeOptions {
            max_retries: config.max_retries,
            ..SubscribeOptions::default()
        },
    );
    let (subscription, mut events) = transport
        .subscribe(target.clone())
        .with_context(|| format!("cannot subscribe to {target}"))?;

    let (done_tx, mut done_rx) = mpsc::channel::<(String, Result<(), ApiError>)>(4);
    if let Some(message) = config.message.as_deref() {
        let PendingChat { temp_id, submission } = session.begin_chat(message);
        tokio::spawn(async move {
            let outcome = submission.await;
            let _ = done_tx.send((temp_id, outcome)).await;
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("fleet_tail_interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    eprintln!("[{target}] stream ended");
                    break;
                };
                let record = match &event {
                    StreamEvent::Record(log) => Some(log.clone()),
                    StreamEvent::State(_) => None,
                };
                let applied = session.apply(&target, event);
                if let (Some(log), Some(Applied::Inserted | Applied::Replaced)) = (record, applied) {
                    print_log(&log, config.show_muted);
                }
            }
            Some((temp_id, outcome)) = done_rx.recv() => {
                session.complete_chat(&temp_id, outcome);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("notices_lagged: {skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    subscription.unsubscribe();
    Ok(())
}

fn print_log(log: &TaskLog, show_muted: bool) {
    let time = log
        .created_at_utc()
        .map(|ts| ts.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let (label, text) = match extract_event(log) {
        Some(event) => {
            let category = classify(&event);
            if category.is_muted() && !show_muted {
                return;
            }
            (category.label().to_string(), summarize(&event))
        }
        None => (log.message_type.clone(), display_text(log)),
    };
    let sender = if log.from_agent.is_empty() {
        "-"
    } else {
        log.from_agent.as_str()
    };
    println!("{time} {sender:>16} {label:<14} {}", text.replace('\n', " "));
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::Connection { target, state } => eprintln!("[{target}] {state}"),
        SessionNotice::SubmissionFailed { reason, .. } => {
            eprintln!("message not delivered: {reason}")
        }
        SessionNotice::HistoryFailed { target, reason } => {
            eprintln!("[{target}] history unavailable: {reason}")
        }
        SessionNotice::SkillsChanged { agent_name } => eprintln!("skills updated for {agent_name}"),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FLEET_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if resolve_log_stdout() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

fn resolve_log_stdout() -> bool {
    env::var("FLEET_LOG_STDOUT")
        .ok()
        .as_deref()
        .and_then(parse_bool_env)
        .unwrap_or(false)
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn resolve_team_id(flag: &str) -> Result<String> {
    if !flag.trim().is_empty() {
        return Ok(flag.trim().to_string());
    }
    match env_non_empty("FLEET_TEAM_ID") {
        Some(value) => Ok(value.trim().to_string()),
        None => bail!("no team given: pass --team or set FLEET_TEAM_ID"),
    }
}

fn resolve_api_url(flag: &str) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        env_non_empty("FLEET_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string())
    };
    Url::parse(raw.trim()).with_context(|| format!("invalid api url: {raw}"))
}

/// Explicit push URL, else the api URL with its scheme swapped to ws/wss and
/// its last path segment replaced by `ws`.
fn resolve_ws_url(flag: &str, api_url: &Url) -> Result<Url> {
    let explicit = if !flag.trim().is_empty() {
        Some(flag.to_string())
    } else {
        env_non_empty("FLEET_WS_URL")
    };
    if let Some(raw) = explicit {
        return Url::parse(raw.trim()).with_context(|| format!("invalid push url: {raw}"));
    }

    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => bail!("cannot derive push url from {other} api url"),
    };
    let mut ws_url = api_url.clone();
    if ws_url.set_scheme(scheme).is_err() {
        bail!("cannot derive push url from {api_url}");
    }
    match ws_url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().pop().push("ws");
        }
        Err(_) => bail!("cannot derive push url from {api_url}"),
    }
    Ok(ws_url)
}

fn resolve_max_retries(flag: Option<u32>) -> u32 {
    if let Some(value) = flag {
        return value;
    }
    env_non_empty("FLEET_MAX_RETRIES")
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_RETRIES)
}
