//! `Deskline` console: a line-oriented operator client.
//!
//! Connects to the backend for one project, keeps the conversation list and
//! the open conversation in sync, and prints a fresh view whenever it
//! changes. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/deskline/config.toml`).
//!
//! ```bash
//! # Against a local sandbox backend
//! cargo run --bin deskline -- --ws-url ws://127.0.0.1:9300/ws \
//!     --api-url http://127.0.0.1:9300/api --project demo
//!
//! # Or via environment variables
//! DESKLINE_WS_URL=ws://127.0.0.1:9300/ws DESKLINE_API_URL=http://127.0.0.1:9300/api \
//!     DESKLINE_PROJECT=demo cargo run --bin deskline
//! ```

use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;

use deskline::api::HttpApi;
use deskline::attachment::OutgoingFile;
use deskline::config::{CliArgs, ClientConfig};
use deskline::connection::ConnectionRegistry;
use deskline::engine::{Intent, Snapshot, SyncEngine};
use deskline::input::{self, Input};
use deskline::messages::Message;
use deskline::notify::NoticeKind;
use deskline::transport::ScopeKey;
use deskline::transport::ws::WsConnector;
use deskline_proto::message::{DeliveryStatus, Direction};

/// Conversations shown in the printed view.
const LIST_ROWS: usize = 10;
/// Messages of the open conversation shown in the printed view.
const HISTORY_ROWS: usize = 15;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // CLI args > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let endpoints = match config.endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(ws = %endpoints.ws_url, api = %endpoints.api_url, project = %endpoints.project, "deskline starting");

    let scope = ScopeKey::new(endpoints.project);
    let registry = ConnectionRegistry::new(
        WsConnector::new(endpoints.ws_url, config.connect_timeout),
        config.reconnect,
    );
    let connection = registry.connect(&scope);
    let api = Arc::new(HttpApi::new(endpoints.api_url.as_str()));

    let (engine, snapshots) = SyncEngine::new(connection, Arc::clone(&api), api, &config.sync);
    let (intent_tx, intent_rx) = mpsc::channel(config.channel_capacity);
    let engine_task = tokio::spawn(engine.run(intent_rx));
    let render_task = tokio::spawn(render_loop(snapshots));

    read_console(&intent_tx).await;
    let _ = intent_tx.send(Intent::Shutdown).await;

    if let Err(e) = engine_task.await {
        tracing::error!(err = %e, "engine task failed");
    }
    registry.disconnect(&scope);
    render_task.abort();

    tracing::info!("deskline exiting");
    ExitCode::SUCCESS
}

/// Initialize logging.
///
/// Stdout carries the console view, so logs go to a file when one is given
/// and to stderr otherwise. Returns a [`WorkerGuard`] that must be held
/// until shutdown to flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Read console lines and forward them to the engine until `/quit` or EOF.
async fn read_console(intents: &mpsc::Sender<Intent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", input::HELP);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(err = %e, "stdin read failed");
                return;
            }
        };

        let intent = match input::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Input::Intent(intent))) => intent,
            Ok(Some(Input::Attach(path))) => match OutgoingFile::read(&path).await {
                Ok(file) => Intent::SendAttachment(file),
                Err(e) => {
                    eprintln!("cannot read {}: {e}", path.display());
                    continue;
                }
            },
            Ok(Some(Input::Help)) => {
                println!("{}", input::HELP);
                continue;
            }
            Ok(Some(Input::Quit)) => return,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        if intents.send(intent).await.is_err() {
            tracing::warn!("engine stopped, closing console");
            return;
        }
    }
}

/// Print the view every time the engine publishes a new snapshot.
async fn render_loop(mut snapshots: watch::Receiver<Snapshot>) {
    while snapshots.changed().await.is_ok() {
        let view = render(&snapshots.borrow_and_update());
        println!("{view}");
    }
}

fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let link = if snapshot.connection.connected {
        "online"
    } else {
        "offline"
    };
    let _ = writeln!(
        out,
        "──── {link} │ filter: {} │ {} conversations{}{}",
        snapshot.filter,
        snapshot.conversations.len(),
        if snapshot.has_more_conversations { " (/more)" } else { "" },
        if snapshot.conversations_loading { " │ loading…" } else { "" },
    );

    for conversation in snapshot.conversations.iter().take(LIST_ROWS) {
        let marker = if snapshot.active == Some(conversation.id) {
            '>'
        } else {
            ' '
        };
        let unread = if conversation.unread_count > 0 {
            format!(" [{}]", conversation.unread_count)
        } else {
            String::new()
        };
        let preview = conversation
            .last_message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{marker} {:>6} {:<9} {:<6} {}{unread}  {preview}",
            conversation.id,
            conversation.platform,
            conversation.status,
            conversation.display_name,
        );
    }

    if let Some(active) = snapshot.active {
        let _ = writeln!(
            out,
            "──── conversation {active}{}{}",
            if snapshot.has_older_messages { " (/older)" } else { "" },
            if snapshot.messages_loading { " │ loading…" } else { "" },
        );
        let skip = snapshot.messages.len().saturating_sub(HISTORY_ROWS);
        for message in &snapshot.messages[skip..] {
            let _ = writeln!(out, "{}", render_message(message));
        }
    }
    if snapshot.uploading {
        let _ = writeln!(out, "uploading…");
    }
    if let Some(notice) = &snapshot.notice {
        let tag = match notice.kind {
            NoticeKind::Success => "ok",
            NoticeKind::Failure => "error",
        };
        let _ = writeln!(out, "[{tag}] {}", notice.message);
    }
    out
}

fn render_message(message: &Message) -> String {
    let who = match message.direction {
        Direction::Incoming => "them",
        Direction::Outgoing => "you ",
    };
    let status = match message.status {
        DeliveryStatus::Pending => " …",
        DeliveryStatus::Done => "",
        DeliveryStatus::Failed => " ✗",
    };
    let body = match (&message.content, &message.attachment) {
        (Some(text), _) => text.clone(),
        (None, Some(attachment)) => format!("[{}]", attachment.file_name),
        (None, None) => format!("[{:?}]", message.message_type),
    };
    format!(
        "{} {who} {body}{status}",
        message.sent_at.as_datetime().format("%H:%M")
    )
}
