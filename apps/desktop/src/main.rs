use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::load_settings_from, CallDecision, ClientDependencies, ClientEvent, Identity,
    RealtimeClient,
};
use shared::domain::UserId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    /// Access token issued by the login service.
    #[arg(long)]
    token: String,
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Users,
    Select(UserId),
    Call(UserId),
    Accept,
    Reject,
    Hangup,
    Reconnect,
    Quit,
    Chat(String),
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(Self::Chat(line.to_string()));
        }
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next();
        let command = match (verb, arg) {
            ("/users", _) => Self::Users,
            ("/select", Some(id)) => match id.parse() {
                Ok(id) => Self::Select(UserId(id)),
                Err(_) => Self::Invalid(format!("not a user id: {id}")),
            },
            ("/call", Some(id)) => match id.parse() {
                Ok(id) => Self::Call(UserId(id)),
                Err(_) => Self::Invalid(format!("not a user id: {id}")),
            },
            ("/select" | "/call", None) => Self::Invalid(format!("usage: {verb} <user id>")),
            ("/accept", _) => Self::Accept,
            ("/reject", _) => Self::Reject,
            ("/hangup", _) => Self::Hangup,
            ("/reconnect", _) => Self::Reconnect,
            ("/quit", _) => Self::Quit,
            _ => Self::Invalid(format!("unknown command: {verb}")),
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let identity = Identity::new(UserId(args.user_id), args.token);
    let deps = ClientDependencies::standard(&settings, &identity);
    let client = RealtimeClient::new(&settings, identity, deps)?;

    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "desktop: events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.start().await;
    info!(user = args.user_id, "desktop: ready; type /quit to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        if command == Command::Quit {
            break;
        }
        run(&client, command).await;
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run(client: &Arc<RealtimeClient>, command: Command) {
    let outcome = match command {
        Command::Users => client.refresh_users().await.map(|_| ()),
        Command::Select(peer) => client.select_peer(peer).await.map(|selected| {
            let name = selected.username.unwrap_or_else(|| format!("user {peer}"));
            println!("* chatting with {name}");
        }),
        Command::Call(peer) => client.start_call(peer).await.map(|_| ()),
        Command::Accept => {
            if client.decide_incoming_call(CallDecision::Accept).await {
                Ok(())
            } else {
                client.accept_call().await
            }
        }
        Command::Reject => {
            if client.decide_incoming_call(CallDecision::Reject).await {
                Ok(())
            } else {
                client.reject_call().await
            }
        }
        Command::Hangup => {
            client.hangup().await;
            Ok(())
        }
        Command::Reconnect => {
            client.reconnect().await;
            Ok(())
        }
        Command::Chat(text) => client.send_chat(&text).await,
        Command::Invalid(reason) => {
            println!("! {reason}");
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(err) = outcome {
        println!("! {err}");
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessageReceived(message) => {
            let when = message
                .timestamp
                .map(|ts| ts.format("%H:%M").to_string())
                .unwrap_or_default();
            let body = match &message.media_file {
                Some(file) => format!("[{}] {file}", message.message_type.as_str()),
                None => message.content.clone(),
            };
            println!("[{when}] {} -> {}: {body}", message.from_user, message.to_user);
        }
        ClientEvent::HistoryLoaded { peer, messages } => {
            println!("* {} messages with user {peer}", messages.len());
            for message in messages {
                println!(
                    "  {} -> {}: {}",
                    message.sender_id,
                    message.receiver_id,
                    message.content.as_deref().unwrap_or("[media]")
                );
            }
        }
        ClientEvent::UserListUpdated(users) => {
            println!("* users:");
            for user in users {
                println!("  {:>4}  {}", user.id, user.username);
            }
        }
        ClientEvent::UserStatusChanged { user_id, status } => {
            println!("* user {user_id} is {status:?}");
        }
        ClientEvent::IncomingCall { peer } => {
            println!("* incoming call from user {peer}: /accept or /reject");
        }
        ClientEvent::CallStatus(text) => println!("* {text}"),
        ClientEvent::Error(text) => println!("! {text}"),
    }
}
