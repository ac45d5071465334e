use anyhow::Context;
use chat_mirror::{
    bus::{Event, EventBus},
    ConversationScope, ConversationView, MessageId, Profile, Remote, Store, SyncConfig, UserId,
    ViewHandle, ViewSnapshot, WriteCoordinator,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// One line of user input.
#[derive(Debug, PartialEq)]
enum Input {
    Send(String),
    Edit(MessageId, String),
    Delete(MessageId),
    Room(String),
    Direct(UserId),
    Resync,
    Quit,
    Usage(&'static str),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Send(line.to_string()));
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    let input = match name {
        "edit" => match rest.split_once(' ') {
            Some((id, body)) => Input::Edit(MessageId::new(id), body.trim().to_string()),
            None => Input::Usage("/edit <id> <text>"),
        },
        "delete" if !rest.is_empty() => Input::Delete(MessageId::new(rest)),
        "delete" => Input::Usage("/delete <id>"),
        "room" if !rest.is_empty() => Input::Room(rest.to_string()),
        "room" => Input::Usage("/room <tag>"),
        "dm" if !rest.is_empty() => Input::Direct(UserId::new(rest)),
        "dm" => Input::Usage("/dm <user>"),
        "resync" => Input::Resync,
        "quit" | "exit" => Input::Quit,
        _ => Input::Usage("/edit <id> <text> | /delete <id> | /room <tag> | /dm <user> | /resync | /quit"),
    };
    Some(input)
}

async fn run_input(
    input: Input,
    writer: &WriteCoordinator,
    view: &ViewHandle,
) -> chat_mirror::SyncResult<()> {
    match input {
        Input::Send(body) => {
            writer.send(&body).await?;
        }
        Input::Edit(id, body) => writer.edit(&id, &body).await?,
        Input::Delete(id) => writer.remove(&id).await?,
        Input::Room(tag) => view.switch_scope(ConversationScope::room(tag)).await?,
        Input::Direct(other) => {
            view.switch_scope(ConversationScope::direct(writer.user().clone(), other))
                .await?
        }
        Input::Resync => view.resync()?,
        Input::Usage(usage) => eprintln!("usage: {}", usage),
        Input::Quit => {}
    }
    Ok(())
}

fn render(snapshot: &ViewSnapshot, json: bool) -> String {
    if json {
        return serde_json::json!({
            "scope": snapshot.scope.to_string(),
            "epoch": snapshot.epoch,
            "syncing": snapshot.syncing,
            "degraded": snapshot.degraded,
            "error": snapshot.last_error.as_ref().map(|e| e.to_string()),
            "messages": snapshot.messages,
        })
        .to_string();
    }

    let mut status = Vec::new();
    if snapshot.syncing {
        status.push("syncing".to_string());
    }
    if snapshot.degraded {
        status.push("offline".to_string());
    }
    if let Some(err) = &snapshot.last_error {
        status.push(format!("error: {}", err));
    }

    let mut out = format!("--- {} ---", snapshot.scope);
    if !status.is_empty() {
        out.push_str(&format!(" [{}]", status.join(", ")));
    }
    for entry in &snapshot.messages {
        let message = &entry.message;
        out.push_str(&format!(
            "\n{} {} {}: {}",
            message.created_at.format("%H:%M:%S"),
            message.id,
            entry.sender.display_name,
            message.body
        ));
        if message.edited {
            out.push_str(" (edited)");
        }
        if entry.pending {
            out.push_str(" (sending)");
        }
    }
    out
}

async fn print_snapshots(mut rx: watch::Receiver<ViewSnapshot>, json: bool) {
    loop {
        let rendered = render(&rx.borrow_and_update(), json);
        println!("{}", rendered);
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Profile edits arrive on the bus; the view refetches the ones it shows.
async fn forward_profile_changes(mut rx: broadcast::Receiver<Event>, view: ViewHandle) {
    loop {
        match rx.recv().await {
            Ok(Event::ProfileChanged(user)) => {
                if view.refresh_profile(user).is_err() {
                    break;
                }
            }
            Ok(Event::Message(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Profile listener lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Logs go to stderr so stdout stays a clean stream of snapshots
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = SyncConfig::from_env();
    info!(user_id = %config.user_id, "Chat mirror starting...");

    let bus = Arc::new(EventBus::with_capacity(config.feed_capacity));

    info!("Initializing store at {}", config.database_path.display());
    let store = Arc::new(Store::new(&config.database_path, bus.clone()).await?);
    store.init().await?;
    store
        .upsert_profile(&Profile::new(
            config.user_id.clone(),
            config.display_name.clone(),
            None,
        ))
        .await
        .context("Failed to register local user")?;

    let view = ConversationView::open(
        Remote::from_backend(store.clone()),
        &config,
        config.initial_scope(),
    );
    let writer = WriteCoordinator::new(store.clone(), view.handle(), config.user_id.clone());

    let printer = tokio::spawn(print_snapshots(view.subscribe(), config.json_output));
    let profile_listener = tokio::spawn(forward_profile_changes(bus.subscribe(), view.handle()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed, shutting down...");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                };
                match parse_input(&line) {
                    Some(Input::Quit) => break,
                    Some(input) => {
                        if let Err(e) = run_input(input, &writer, &view.handle()).await {
                            error!("{}", e);
                        }
                    }
                    None => {}
                }
            }
        }
    }

    profile_listener.abort();
    printer.abort();
    view.close().await;
    Ok(())
}
