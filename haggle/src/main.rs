//! `haggle` — headless marketplace chat client.
//!
//! Connects to the marketplace backend, opens the conversation with
//! `--counterpart`, prints its timeline and live updates, and sends each
//! line read from stdin. Configuration via CLI flags, environment variables,
//! or config file (`~/.config/haggle/config.toml`).
//!
//! ```bash
//! cargo run --bin haggle -- --api-url https://api.example.com \
//!     --socket-url wss://api.example.com/socket \
//!     --user-id buyer-7 --token "$TOKEN" --counterpart seller-1
//! ```
//!
//! Type `/quit` (or close stdin) to log out.

use std::collections::HashSet;
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

use haggle::chat::history::HttpRestClient;
use haggle::chat::media::HttpMediaUploader;
use haggle::chat::send::Draft;
use haggle::config::{CliArgs, ClientConfig, SessionConfig};
use haggle::engine::SyncEngine;
use haggle::timeline::ChangeKind;
use haggle::transport::ConnectionState;
use haggle::transport::websocket::WebSocketConnector;
use haggle_proto::message::{ConversationKey, Message, MessageId, Timestamp, UserId};

type Engine = SyncEngine<WebSocketConnector, HttpRestClient, HttpMediaUploader>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load config file: {e}");
            return ExitCode::from(2);
        }
    };

    // Logs go to a file; stdout carries the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(session) = config.to_session() else {
        eprintln!("error: --api-url, --socket-url, --user-id and --token are required");
        return ExitCode::from(2);
    };

    tracing::info!(user = %session.credentials.user_id(), "haggle starting");
    let result = run(&config, session).await;
    tracing::info!("haggle exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log lines are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("haggle.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig, session: SessionConfig) -> Result<(), Box<dyn Error>> {
    let token = session.credentials.token().to_string();
    let connector = WebSocketConnector::new(&session.socket_url)?;
    let api = HttpRestClient::new(&session.api_url, token.as_str(), config.request_timeout)?;
    let uploader = HttpMediaUploader::new(&session.api_url, token, config.request_timeout)?;

    let engine: Engine =
        SyncEngine::start(config, connector, api, uploader, session.credentials).await?;
    println!("connected as {}", engine.me());

    match engine.refresh_conversations().await {
        Ok(list) => {
            for conversation in list {
                println!(
                    "  {:<20} {:>3} unread  {}",
                    conversation.counterpart.as_str(),
                    conversation.unread_count,
                    conversation.last_message_summary.unwrap_or_default()
                );
            }
        }
        Err(e) => eprintln!("warning: could not load conversations: {e}"),
    }

    if let Some(counterpart) = config.counterpart.clone().map(UserId::new) {
        chat_loop(&engine, &counterpart).await?;
    }

    engine.shutdown().await;
    Ok(())
}

async fn chat_loop(engine: &Engine, counterpart: &UserId) -> Result<(), Box<dyn Error>> {
    let key = ConversationKey::between(engine.me(), counterpart);
    let mut changes = engine.store().subscribe();
    let mut typing = engine.typing().subscribe();
    let mut presence = engine.presence().subscribe();
    let mut state = engine.connection().watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    engine.select_conversation(counterpart).await?;
    println!(
        "--- {counterpart} ({}) ---",
        engine.presence().status(counterpart)
    );
    let mut printed = HashSet::new();
    print_new(engine, counterpart, &mut printed);
    if let Err(e) = engine.mark_read(counterpart).await {
        tracing::warn!(error = %e, "mark read failed");
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                match engine.submit(Draft::text(counterpart.clone(), line)) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            if let Err(failure) = pending.outcome().await {
                                println!("! not sent ({}): {}", failure.error, failure.draft.body);
                            }
                        });
                    }
                    Err(failure) => println!("! not sent ({}): {}", failure.error, failure.draft.body),
                }
            }
            change = changes.recv() => match change {
                Ok(change) if change.key == key => {
                    if change.kind == ChangeKind::Offer {
                        print_offers(engine, counterpart);
                    }
                    print_new(engine, counterpart, &mut printed);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            change = typing.recv() => {
                if let Ok(change) = change
                    && change.user_id == *counterpart
                {
                    let verb = if change.is_typing { "is typing..." } else { "stopped typing" };
                    println!("  {counterpart} {verb}");
                }
            }
            change = presence.recv() => {
                if let Ok(change) = change
                    && change.user_id == *counterpart
                {
                    println!("  {counterpart} is {}", change.status);
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("  [{current}]");
                if matches!(current, ConnectionState::NeedsLogin) {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Print confirmed messages not shown yet.
fn print_new(engine: &Engine, counterpart: &UserId, printed: &mut HashSet<MessageId>) {
    for message in engine.timeline(counterpart) {
        if message.id.is_provisional() || !printed.insert(message.id.clone()) {
            continue;
        }
        println!("{}", format_message(&message));
    }
}

fn print_offers(engine: &Engine, counterpart: &UserId) {
    for offer in engine
        .timeline(counterpart)
        .into_iter()
        .filter_map(|m| m.offer)
    {
        println!("  offer {} is {}", offer.order_id, offer.status);
    }
}

fn format_message(message: &Message) -> String {
    let time = format_time(message.created_at);
    let mut line = format!("[{time}] {}: {}", message.sender_id, message.summary());
    if let Some(offer) = &message.offer {
        let price = offer.price.map_or_else(String::new, |p| format!(" @ {p:.2}"));
        line.push_str(&format!("  <offer {}{price} {}>", offer.order_id, offer.status));
    }
    line
}

fn format_time(at: Timestamp) -> String {
    i64::try_from(at.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| "--:--".to_string(), |t| t.format("%H:%M").to_string())
}
