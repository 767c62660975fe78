use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    load_settings, start_client, ClientEvent, Credential, EngineHandle, SessionEvent,
};
use shared::domain::{ConversationId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml.
    #[arg(long)]
    server_url: Option<String>,
    /// Access token; stored for later runs. Defaults to the stored one.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: i64,
    /// Conversation to open on start.
    #[arg(long)]
    conversation: Option<i64>,
    /// Overrides `store_path` from client.toml.
    #[arg(long)]
    store: Option<String>,
}

const HELP: &str = "commands: /open <id>  /with <user id>  /list  /swap <minutes>  /confirm  /cancel  /older  /dismiss  /reset  /logout  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(store) = args.store {
        settings.store_path = store;
    }

    let (handle, events, task) =
        start_client(&settings, UserId(args.user_id), args.token.map(Credential::new)).await?;
    tokio::spawn(print_events(events));

    let mut current = args.conversation.map(ConversationId);
    if let Some(conversation_id) = current {
        handle.open_conversation(conversation_id).await?;
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&handle, &mut current, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("error: {err:#}"),
        }
    }

    handle.shutdown().await;
    let _ = task.await;
    Ok(())
}

/// Returns `false` when the session should end.
async fn run_command(
    handle: &EngineHandle,
    current: &mut Option<ConversationId>,
    line: &str,
) -> Result<bool> {
    let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
    let argument = argument.trim();
    let selected = *current;
    let open = || selected.ok_or_else(|| anyhow!("no conversation open, use /open or /with"));

    match command {
        "/quit" => return Ok(false),
        "/logout" => {
            handle.sign_out().await;
            return Ok(false);
        }
        "/help" => println!("{HELP}"),
        "/open" => {
            let conversation_id = ConversationId(argument.parse()?);
            handle.open_conversation(conversation_id).await?;
            *current = Some(conversation_id);
        }
        "/with" => {
            let conversation = handle.find_or_create(UserId(argument.parse()?)).await?;
            handle.open_conversation(conversation.id).await?;
            *current = Some(conversation.id);
        }
        "/list" => {
            for conversation in handle.list_conversations().await? {
                let names: Vec<&str> = conversation
                    .participants()
                    .iter()
                    .map(|p| p.username.as_str())
                    .collect();
                println!("  #{} {}", conversation.id, names.join(", "));
            }
        }
        "/swap" => {
            let minutes = if argument.is_empty() { 5 } else { argument.parse()? };
            handle.request_swapanza(open()?, minutes).await?;
        }
        "/confirm" => handle.confirm_swapanza(open()?).await?,
        "/cancel" => handle.cancel_swapanza(open()?).await?,
        "/older" => {
            let added = handle.load_older(open()?).await?;
            println!("loaded {added} older messages");
        }
        "/dismiss" => {
            let conversation_id = open()?;
            handle.dismiss(conversation_id).await?;
            handle.close_conversation(conversation_id).await;
            *current = None;
        }
        "/reset" => handle.reset_notifications().await?,
        _ if command.starts_with('/') => println!("unknown command, {HELP}"),
        _ => {
            handle.send_message(open()?, line).await?;
        }
    }
    Ok(true)
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("(skipped {skipped} events)");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::Message { message, .. } => {
                let marker = if message.pending { " (sending)" } else { "" };
                println!("[{}] {}{}", message.display_sender(), message.content, marker);
            }
            ClientEvent::MessageRejected {
                restored_content,
                reason,
                ..
            } => match restored_content {
                Some(content) => println!("not sent ({reason}): {content}"),
                None => println!("not sent: {reason}"),
            },
            ClientEvent::Session { event, .. } => match event {
                SessionEvent::Requested {
                    requested_by_username,
                    duration,
                    needs_confirmation,
                    ..
                } => {
                    let who = requested_by_username.unwrap_or_else(|| "someone".to_string());
                    if needs_confirmation {
                        println!("{who} wants a {duration} minute swapanza, /confirm to accept");
                    } else {
                        println!("swapanza requested for {duration} minutes");
                    }
                }
                SessionEvent::Activated {
                    remaining_seconds,
                    remaining_messages,
                    ..
                } => println!(
                    "swapanza started: {remaining_seconds}s, {remaining_messages} messages"
                ),
                SessionEvent::Countdown {
                    remaining_seconds, ..
                } if remaining_seconds % 30 == 0 => println!("swapanza: {remaining_seconds}s left"),
                SessionEvent::QuotaUpdated { remaining_messages } => {
                    println!("swapanza: {remaining_messages} messages left")
                }
                SessionEvent::Ended { reason } => println!("swapanza ended ({reason:?})"),
                _ => {}
            },
            ClientEvent::UnreadChanged {
                conversation_id,
                count,
            } if count > 0 => println!("#{conversation_id}: {count} unread"),
            ClientEvent::InviteReceived {
                conversation_id,
                from,
            } => println!(
                "#{conversation_id}: swapanza invite from {}",
                from.as_deref().unwrap_or("someone")
            ),
            ClientEvent::ConnectionLost { key } => println!("connection lost ({key:?}), retrying"),
            ClientEvent::Connected {
                key,
                reconnected: true,
            } => println!("reconnected ({key:?})"),
            ClientEvent::Error(message) => println!("server error: {message}"),
            ClientEvent::SignedOut { reason } => {
                println!("signed out: {reason:?}");
                return;
            }
            _ => {}
        }
    }
}
