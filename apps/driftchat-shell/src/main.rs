//! Headless driftchat shell.
//!
//! Wires the runtime to local in-memory backends and drives it from stdin,
//! rendering reducer snapshots as plain text.

mod config;
mod logging;
mod recent;
mod state;

use std::{
    process,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use client_backend::{
    ChatStore, InMemoryChatStore, InMemoryPresenceStore, ScriptedAuthProvider,
};
use client_core::types::{ClientCommand, ClientEvent, Identity, UserProfile};
use client_runtime::{ClientContext, ClientRuntimeHandle, spawn_runtime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use config::ShellConfig;
use recent::{RecentCache, clear_recent_cache, load_recent_cache, save_recent_cache};
use state::{ShellSnapshot, ShellState};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ShellConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            process::exit(2);
        }
    };

    let store = InMemoryChatStore::new();
    let realtime = InMemoryPresenceStore::new();
    let auth = ScriptedAuthProvider::always(config.local_identity());
    seed_directory(&store).await;

    let context = ClientContext {
        store: Arc::new(store.clone()),
        realtime: Arc::new(realtime),
        auth: Arc::new(auth),
    };
    let handle = spawn_runtime(context, config.runtime_config());

    let state = Arc::new(Mutex::new(ShellState::new(config.typing_window_ms)));
    let cache_path = config.recent_cache_path();
    match load_recent_cache(&cache_path) {
        Ok(Some(cache)) if cache.identity_id == config.local_user_id => {
            if let Ok(mut guard) = state.lock() {
                guard.prime_recent_cache(cache.conversations);
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "ignoring unreadable recent cache"),
    }

    spawn_event_pump(handle.clone(), state.clone(), cache_path);

    print_help();
    run_input_loop(&handle, &state).await;

    // Best-effort graceful sign-out so presence goes offline before exit.
    let signed_in = state
        .lock()
        .map(|guard| guard.identity().is_some())
        .unwrap_or(false);
    if signed_in {
        let _ = handle.send(ClientCommand::SignOut).await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    }
    info!("shell exiting");
}

/// Seed a couple of directory peers so search/open work out of the box.
async fn seed_directory(store: &InMemoryChatStore) {
    let now = now_ms();
    for (id, name) in [("u-bob", "Bob"), ("u-carol", "Carol")] {
        let identity = Identity {
            id: id.to_owned(),
            display_name: name.to_owned(),
            email: format!("{id}@driftchat.local"),
            avatar_url: None,
        };
        if let Err(err) = store
            .upsert_user(UserProfile::from_identity(&identity, now))
            .await
        {
            warn!(error = %err, %id, "failed seeding directory user");
        }
    }
}

fn spawn_event_pump(
    handle: ClientRuntimeHandle,
    state: Arc<Mutex<ShellState>>,
    cache_path: std::path::PathBuf,
) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "shell lagged behind runtime events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            if let ClientEvent::RecentConversations { conversations } = &event {
                persist_recent(&state, &cache_path, conversations.clone());
            }
            if matches!(&event, ClientEvent::AuthStateChanged { identity: None })
                && let Err(err) = clear_recent_cache(&cache_path)
            {
                warn!(error = %err, "failed clearing recent cache on sign-out");
            }

            let snapshot = {
                let Ok(mut guard) = state.lock() else {
                    return;
                };
                guard.handle_event(event.clone());
                guard.snapshot(now_ms())
            };
            print_event(&event, &snapshot);
        }
    });
}

fn persist_recent(
    state: &Arc<Mutex<ShellState>>,
    cache_path: &std::path::Path,
    conversations: Vec<client_core::types::Conversation>,
) {
    let identity_id = state
        .lock()
        .ok()
        .and_then(|guard| guard.identity().map(|identity| identity.id.clone()));
    let Some(identity_id) = identity_id else {
        return;
    };

    let cache = RecentCache {
        identity_id,
        conversations,
    };
    if let Err(err) = save_recent_cache(cache_path, &cache) {
        warn!(error = %err, "failed persisting recent cache");
    }
}

async fn run_input_loop(handle: &ClientRuntimeHandle, state: &Arc<Mutex<ShellState>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let outcome = match command {
            "" => Ok(()),
            "help" => {
                print_help();
                Ok(())
            }
            "signin" => handle.send(ClientCommand::SignIn).await,
            "signout" => handle.send(ClientCommand::SignOut).await,
            "search" => {
                handle
                    .send(ClientCommand::SearchUsers {
                        query: rest.to_owned(),
                    })
                    .await
            }
            "open" => {
                handle
                    .send(ClientCommand::OpenConversation {
                        peer_id: rest.to_owned(),
                    })
                    .await
            }
            "close" => handle.send(ClientCommand::CloseConversation).await,
            "draft" => {
                if let Ok(mut guard) = state.lock() {
                    guard.set_draft(rest);
                }
                handle
                    .send(ClientCommand::InputActivity {
                        has_text: !rest.is_empty(),
                    })
                    .await
            }
            "blur" => handle.send(ClientCommand::InputBlurred).await,
            "emoji" => {
                if let Ok(mut guard) = state.lock() {
                    guard.toggle_emoji_picker();
                    println!(
                        "emoji picker {}",
                        if guard.snapshot(now_ms()).emoji_picker_open {
                            "open"
                        } else {
                            "closed"
                        }
                    );
                }
                Ok(())
            }
            "send" => {
                let (client_txn_id, text) = {
                    let Ok(mut guard) = state.lock() else {
                        continue;
                    };
                    if !rest.is_empty() {
                        guard.set_draft(rest);
                    }
                    let client_txn_id = Uuid::new_v4().to_string();
                    guard.begin_send(&client_txn_id);
                    (client_txn_id, guard.draft().to_owned())
                };
                handle
                    .send(ClientCommand::SendMessage {
                        client_txn_id,
                        text,
                    })
                    .await
            }
            "delete" => {
                handle
                    .send(ClientCommand::DeleteMessage {
                        message_id: rest.to_owned(),
                    })
                    .await
            }
            "hide" => {
                handle
                    .send(ClientCommand::VisibilityChanged { hidden: true })
                    .await
            }
            "show" => {
                handle
                    .send(ClientCommand::VisibilityChanged { hidden: false })
                    .await
            }
            "state" => {
                if let Ok(guard) = state.lock() {
                    print_snapshot(&guard.snapshot(now_ms()));
                }
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{other}'; type 'help'");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(error = %err, "runtime is gone; stopping input loop");
            break;
        }
    }
}

fn print_event(event: &ClientEvent, snapshot: &ShellSnapshot) {
    match event {
        ClientEvent::MessagesReplaced { .. } => {
            println!("-- messages ({}) --", snapshot.messages.len());
            for row in &snapshot.messages {
                let marker = if row.is_own { "*" } else { " " };
                println!("{marker} [{}] {}: {}", row.id, row.sender_name, row.text);
            }
        }
        ClientEvent::SearchResults { query, .. } => {
            println!("-- search '{query}' ({}) --", snapshot.search_results.len());
            for user in &snapshot.search_results {
                println!("  {} ({})", user.display_name, user.id);
            }
        }
        ClientEvent::RecentConversations { .. } => {
            println!(
                "-- recent conversations ({}) --",
                snapshot.recent_conversations.len()
            );
            for conversation in &snapshot.recent_conversations {
                println!("  {}", conversation.id);
            }
        }
        ClientEvent::SelfPresence { .. } => {
            if let Some(name) = &snapshot.signed_in_as {
                println!("{name} (you): {}", snapshot.self_status);
            }
        }
        ClientEvent::PeerPresence { .. } | ClientEvent::PeerTyping { .. } => {
            if let Some(peer) = &snapshot.active_peer {
                println!("{peer}: {}", snapshot.peer_status);
            }
        }
        ClientEvent::ConversationOpened { peer, .. } => {
            println!("conversation with {} opened", peer.display_name);
        }
        ClientEvent::ConversationClosed => println!("conversation closed"),
        ClientEvent::SendAck(ack) => match &ack.error_code {
            Some(code) => println!("send failed ({code}); draft preserved"),
            None => println!("message sent"),
        },
        ClientEvent::DeleteAck(ack) => match &ack.error_code {
            Some(code) => println!("delete of {} failed ({code})", ack.message_id),
            None => println!("deleted {}", ack.message_id),
        },
        ClientEvent::StateChanged { .. }
        | ClientEvent::AuthStateChanged { .. }
        | ClientEvent::AuthResult { .. }
        | ClientEvent::FeedStatus(_)
        | ClientEvent::FatalError { .. } => {
            match &snapshot.error_text {
                Some(error) => println!("[{}] {error}", snapshot.status_text),
                None => println!("[{}]", snapshot.status_text),
            }
        }
    }
}

fn print_snapshot(snapshot: &ShellSnapshot) {
    println!("status   : {}", snapshot.status_text);
    if let Some(error) = &snapshot.error_text {
        println!("error    : {error}");
    }
    println!(
        "identity : {} ({})",
        snapshot.signed_in_as.as_deref().unwrap_or("(signed out)"),
        snapshot.self_status
    );
    match &snapshot.active_peer {
        Some(peer) => println!("peer     : {peer} ({})", snapshot.peer_status),
        None => println!("peer     : (none)"),
    }
    println!("draft    : '{}'", snapshot.draft);
    println!(
        "can send : {} (feed {})",
        snapshot.can_send,
        if snapshot.feed_connected {
            "connected"
        } else {
            "disconnected"
        }
    );
    println!("messages : {}", snapshot.messages.len());
    for row in &snapshot.messages {
        let marker = if row.is_own { "*" } else { " " };
        println!(
            "  {marker} [{} @ {} ms] {}: {}",
            row.id, row.sent_at_ms, row.sender_name, row.text
        );
    }
}

fn print_help() {
    println!("commands:");
    println!("  signin | signout");
    println!("  search <name-prefix>");
    println!("  open <peer-id> | close     (seeded peers: u-bob, u-carol)");
    println!("  draft <text> | blur | emoji");
    println!("  send [text] | delete <message-id>");
    println!("  hide | show                (visibility -> presence)");
    println!("  state | help | quit");
}
