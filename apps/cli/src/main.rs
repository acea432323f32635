use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, read_state::UnreadEntry, start_sync, window::PendingState, ChatSync,
    OutgoingMessage, SyncEvent, WindowSnapshot,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, Message},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// REST base url, e.g. http://127.0.0.1:8000/api/v1
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    /// Conversation to open on startup.
    #[arg(long)]
    open: Option<String>,
    #[arg(long)]
    page_size: Option<u32>,
}

const HELP: &str = "commands: /list  /open <id>  /close  /older  /edit <id> <text>  /delete <id>  \
/retry <local-id>  /discard <local-id>  /reconnect  /quit  (anything else is sent)";

fn format_message(message: &Message, self_id: &UserId) -> String {
    let who = if message.is_from(self_id) {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    let body = match (&message.text, &message.attachment) {
        (Some(text), _) => text.clone(),
        (None, Some(attachment)) => format!("[{}] {}", message.kind.as_str(), attachment.url),
        (None, None) => String::new(),
    };
    let mut flags = String::new();
    if message.edited {
        flags.push_str(" (edited)");
    }
    if message.is_from(self_id) && message.read {
        flags.push_str(" (read)");
    }
    format!(
        "{} {} {who}: {body}{flags}",
        message.created_at.format("%H:%M"),
        message.id
    )
}

fn print_conversations(
    conversations: &[ConversationSummary],
    unread: &HashMap<ConversationId, UnreadEntry>,
) {
    for summary in conversations {
        let marker = if unread.contains_key(&summary.id) { "*" } else { " " };
        let when = summary
            .last_activity_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{marker} {:<24} {:<20} {when}", summary.id, summary.display_name());
    }
}

fn print_window(window: &WindowSnapshot, self_id: &UserId) {
    println!(
        "== {} ({} messages, {:?}){}",
        window.conversation_id,
        window.messages.len(),
        window.pagination,
        if window.can_send { "" } else { " [read-only]" }
    );
    for message in &window.messages {
        println!("  {}", format_message(message, self_id));
    }
    for pending in &window.pending {
        let state = match &pending.state {
            PendingState::Sending => "sending".to_string(),
            PendingState::Failed(reason) => format!("failed: {reason}"),
        };
        println!(
            "  .. {} {} ({state})",
            pending.local_id,
            pending.outgoing.trimmed_text().unwrap_or("[attachment]")
        );
    }
}

/// Prints live updates for the open conversation as they land.
async fn follow_events(sync: Arc<ChatSync>) {
    let mut events = sync.events();
    let mut last_printed: Option<MessageId> = None;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: dropped sync events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SyncEvent::WindowChanged(_) => {
                let Some(window) = sync.window().await else {
                    last_printed = None;
                    continue;
                };
                let newest = window.messages.last();
                if newest.map(|m| &m.id) != last_printed.as_ref() {
                    if let Some(message) = newest {
                        println!("  {}", format_message(message, sync.self_id()));
                    }
                    last_printed = newest.map(|m| m.id.clone());
                }
            }
            SyncEvent::OlderPrepended { anchor, .. } => {
                println!("-- loaded {} older messages", anchor.inserted);
            }
            SyncEvent::PageFailed { page, reason, .. } => {
                println!("!! page {page} failed: {reason} (use /older to retry)");
            }
            SyncEvent::Connection(state) => println!("-- connection: {state:?}"),
            SyncEvent::ConnectionLost => println!("!! offline; use /reconnect to try again"),
            SyncEvent::SubscriptionFailed {
                conversation_id,
                reason,
            } => println!("!! live updates unavailable for {conversation_id}: {reason}"),
            SyncEvent::SendFailed {
                local_id, reason, ..
            } => println!("!! send {local_id} failed: {reason} (/retry or /discard)"),
            SyncEvent::SessionTerminated(reason) => {
                println!("!! session ended: {reason}");
                break;
            }
            SyncEvent::UnreadChanged | SyncEvent::ConversationsChanged => {}
        }
    }
}

async fn open(sync: &ChatSync, conversation_id: &str) -> Result<()> {
    sync.open(ConversationId::from(conversation_id)).await?;
    if let Some(window) = sync.window().await {
        print_window(&window, sync.self_id());
    }
    Ok(())
}

/// Runs one input line. Returns false when the user quits.
async fn handle_line(sync: &ChatSync, line: &str) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/quit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/list" => print_conversations(&sync.conversations().await, &sync.unread().await),
        "/open" if !rest.is_empty() => open(sync, rest).await?,
        "/close" => sync.close().await,
        "/older" => match sync.load_older().await? {
            Some(_) => {}
            None => println!("-- nothing more to load"),
        },
        "/edit" => {
            let (id, text) = rest.split_once(' ').context("usage: /edit <id> <text>")?;
            sync.edit(&MessageId::from(id), text.trim()).await?;
        }
        "/delete" if !rest.is_empty() => sync.delete(&MessageId::from(rest)).await?,
        "/retry" if !rest.is_empty() => {
            sync.retry_send(rest).await?;
        }
        "/discard" if !rest.is_empty() => sync.discard_pending(rest).await?,
        "/reconnect" => sync.reconnect()?,
        other if other.starts_with('/') => println!("{HELP}"),
        _ => {
            let conversation_id = sync
                .current()
                .await
                .context("open a conversation first (/open <id>)")?;
            sync.send(OutgoingMessage::text(conversation_id, line)).await?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(push_url) = args.push_url {
        settings.push_url = Some(push_url);
    }
    if let Some(page_size) = args.page_size {
        settings.page_size = page_size.max(1);
    }

    let sync = start_sync(settings, &args.token, UserId::new(args.user_id)).await?;
    println!("Signed in as {}", sync.self_id());
    print_conversations(&sync.conversations().await, &sync.unread().await);
    println!("{HELP}");

    let follower = tokio::spawn(follow_events(Arc::clone(&sync)));
    if let Some(conversation_id) = args.open {
        if let Err(err) = open(&sync, &conversation_id).await {
            eprintln!("!! {err:#}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle_line(&sync, &line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("!! {err:#}"),
        }
    }

    sync.teardown().await;
    follower.abort();
    Ok(())
}
