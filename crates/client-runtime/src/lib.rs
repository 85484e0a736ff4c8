//! Client synchronization runtime.
//!
//! Owns the injected backend context and drives the closed loop: commands in,
//! backend writes out, backend change events back in through live
//! subscriptions, client events out to consumers.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use client_backend::{AuthError, AuthProvider, ChatStore, PresenceStore, StoreError};
use client_core::{
    ClientChannelError, ClientChannels, ClientError, ClientErrorCategory, EventStream,
    MessageFeed, RetryPolicy, SendOutcome, SessionStateMachine, conversation_id,
    normalization::{normalize_delete_outcome, normalize_fatal_error, normalize_send_outcome},
    participant_ids,
    presence::{HEARTBEAT_INTERVAL_MS, TYPING_STALE_AFTER_MS},
    types::{
        ClientCommand, ClientEvent, Conversation, FeedStatus, Identity, Message, MessageDraft,
        PresenceRecord, TypingRecord, UserProfile,
    },
    validate_peer_id,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Explicitly constructed backend handles injected into the runtime.
#[derive(Clone)]
pub struct ClientContext {
    pub store: Arc<dyn ChatStore>,
    pub realtime: Arc<dyn PresenceStore>,
    pub auth: Arc<dyn AuthProvider>,
}

/// Runtime tuning values.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Interval between online-presence republishes.
    pub heartbeat_interval: Duration,
    /// Debounce window after which an unrefreshed typing signal is stopped.
    pub typing_window: Duration,
    /// Backoff policy for feed resubscribe attempts.
    pub feed_retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            typing_window: Duration::from_millis(TYPING_STALE_AFTER_MS),
            feed_retry: RetryPolicy::default(),
        }
    }
}

/// Handle used by consumers to drive the runtime.
#[derive(Clone)]
pub struct ClientRuntimeHandle {
    channels: ClientChannels,
}

impl ClientRuntimeHandle {
    pub async fn send(&self, command: ClientCommand) -> Result<(), ClientChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the runtime task and return its handle.
pub fn spawn_runtime(context: ClientContext, config: RuntimeConfig) -> ClientRuntimeHandle {
    let (channels, command_rx) = ClientChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = ClientRuntime::new(channels.clone(), command_rx, context, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ClientRuntimeHandle { channels }
}

struct ActiveSession {
    identity: Identity,
    /// Mirrors document visibility; a hidden view suppresses heartbeats.
    visible: Arc<AtomicBool>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    fn shutdown(self) {
        self.stop.cancel();
        drop(self.tasks);
    }
}

struct ActiveConversation {
    conversation: Conversation,
    peer_id: String,
    /// Shared snapshot updated by the feed task; read for delete guards.
    feed: Arc<Mutex<MessageFeed>>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Pending debounced typing-stopped write, cancelled by fresh activity.
    typing_stop: Option<CancellationToken>,
}

impl ActiveConversation {
    fn shutdown(mut self) {
        if let Some(pending) = self.typing_stop.take() {
            pending.cancel();
        }
        self.stop.cancel();
        drop(self.tasks);
    }
}

struct ClientRuntime {
    channels: ClientChannels,
    command_rx: mpsc::Receiver<ClientCommand>,
    state_machine: SessionStateMachine,
    context: ClientContext,
    config: RuntimeConfig,
    session: Option<ActiveSession>,
    conversation: Option<ActiveConversation>,
}

impl ClientRuntime {
    fn new(
        channels: ClientChannels,
        command_rx: mpsc::Receiver<ClientCommand>,
        context: ClientContext,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            channels,
            command_rx,
            state_machine: SessionStateMachine::default(),
            context,
            config,
            session: None,
            conversation: None,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            if let Err(err) = self.handle_command(command).await {
                let recoverable = err.is_recoverable();
                self.channels.emit(normalize_fatal_error(err, recoverable));
            }
        }
    }

    async fn handle_command(&mut self, command: ClientCommand) -> Result<(), ClientError> {
        match command {
            ClientCommand::SignIn => {
                self.handle_sign_in().await;
                Ok(())
            }
            ClientCommand::SignOut => self.handle_sign_out().await,
            ClientCommand::SearchUsers { query } => self.handle_search_users(query).await,
            ClientCommand::OpenConversation { peer_id } => {
                self.handle_open_conversation(peer_id).await
            }
            ClientCommand::CloseConversation => self.handle_close_conversation().await,
            ClientCommand::SendMessage {
                client_txn_id,
                text,
            } => {
                self.handle_send_message(client_txn_id, text).await;
                Ok(())
            }
            ClientCommand::DeleteMessage { message_id } => {
                self.handle_delete_message(message_id).await;
                Ok(())
            }
            ClientCommand::InputActivity { has_text } => {
                self.handle_input_activity(has_text).await;
                Ok(())
            }
            ClientCommand::InputBlurred => {
                self.handle_input_blurred().await;
                Ok(())
            }
            ClientCommand::VisibilityChanged { hidden } => {
                self.handle_visibility_changed(hidden).await;
                Ok(())
            }
        }
    }

    async fn handle_sign_in(&mut self) {
        let transition = self.validate_transition(&ClientCommand::SignIn);
        let Ok((candidate, transition_events)) = transition else {
            if let Err(err) = transition {
                self.emit_auth_failure(err);
            }
            return;
        };
        self.commit_transition(candidate, transition_events);

        let sign_in_result = self.context.auth.sign_in().await;
        let identity = match sign_in_result {
            Ok(identity) => identity,
            Err(err) => {
                self.finish_auth(false, Some(map_auth_error(err)));
                return;
            }
        };

        let now = now_ms();
        let profile = UserProfile::from_identity(&identity, now);
        if let Err(err) = self.context.store.upsert_user(profile).await {
            self.finish_auth(false, Some(map_store_error(err)));
            return;
        }

        // Presence publication is fire-and-forget; a failed write must not
        // abort an otherwise successful sign-in.
        self.publish_presence(&identity.id, true, now).await;
        let offline_record = PresenceRecord {
            identity_id: identity.id.clone(),
            online: false,
            last_online_ms: now,
        };
        if let Err(err) = self
            .context
            .realtime
            .register_on_disconnect(&identity.id, offline_record)
            .await
        {
            warn!(error = %err, "failed registering disconnect hook");
        }

        self.session = Some(self.start_session(identity.clone()));
        self.finish_auth(true, None);
        self.channels.emit(ClientEvent::AuthStateChanged {
            identity: Some(identity.clone()),
        });

        match self.context.store.conversations_for(&identity.id).await {
            Ok(conversations) => {
                self.channels
                    .emit(ClientEvent::RecentConversations { conversations });
            }
            Err(err) => {
                warn!(error = %err, "failed loading recent conversations");
            }
        }
    }

    async fn handle_sign_out(&mut self) -> Result<(), ClientError> {
        let (candidate, transition_events) = self.validate_transition(&ClientCommand::SignOut)?;

        self.clear_typing("signing out").await;
        if let Some(conversation) = self.conversation.take() {
            conversation.shutdown();
        }

        if let Some(session) = self.session.take() {
            // Presence must be marked offline before the session is
            // invalidated; once signed out the client loses write access.
            self.publish_presence(&session.identity.id, false, now_ms())
                .await;
            if let Err(err) = self.context.auth.sign_out().await {
                warn!(error = %err, "provider sign-out failed; clearing local session anyway");
            }
            session.shutdown();
        }

        self.commit_transition(candidate, transition_events);
        self.channels
            .emit(ClientEvent::AuthStateChanged { identity: None });
        Ok(())
    }

    async fn handle_search_users(&mut self, query: String) -> Result<(), ClientError> {
        let (_candidate, _events) = self.validate_transition(&ClientCommand::SearchUsers {
            query: String::new(),
        })?;

        let trimmed = query.trim();
        if trimmed.is_empty() {
            self.channels.emit(ClientEvent::SearchResults {
                query,
                users: Vec::new(),
            });
            return Ok(());
        }

        let users = self
            .context
            .store
            .search_users(trimmed)
            .await
            .map_err(map_store_error)?;
        self.channels.emit(ClientEvent::SearchResults { query, users });
        Ok(())
    }

    async fn handle_open_conversation(&mut self, peer_id: String) -> Result<(), ClientError> {
        let (candidate, transition_events) =
            self.validate_transition(&ClientCommand::OpenConversation {
                peer_id: String::new(),
            })?;

        let identity = self.require_identity()?;
        validate_peer_id(&identity.id, &peer_id)?;

        let peer = self
            .context
            .store
            .get_user(&peer_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| {
                ClientError::validation(
                    "invalid_peer_id",
                    format!("no directory record for '{peer_id}'"),
                )
            })?;

        let conversation = self.ensure_conversation(&identity.id, &peer_id).await?;

        // Unsubscribe-then-resubscribe: the previous conversation's feeds are
        // cancelled before the new ones are spawned, never layered.
        self.clear_typing("switching conversations").await;
        if let Some(previous) = self.conversation.take() {
            previous.shutdown();
        }

        // Announce the conversation before the first feed snapshot can be
        // emitted, so consumers never drop it as belonging to a stale view.
        self.commit_transition(candidate, transition_events);
        self.channels.emit(ClientEvent::ConversationOpened {
            conversation: conversation.clone(),
            peer,
        });

        let active = self.open_subscriptions(conversation, peer_id);
        self.conversation = Some(active);
        Ok(())
    }

    async fn handle_close_conversation(&mut self) -> Result<(), ClientError> {
        let (candidate, transition_events) =
            self.validate_transition(&ClientCommand::CloseConversation)?;

        self.clear_typing("closing conversation").await;
        if let Some(conversation) = self.conversation.take() {
            conversation.shutdown();
        }

        self.commit_transition(candidate, transition_events);
        self.channels.emit(ClientEvent::ConversationClosed);
        Ok(())
    }

    async fn handle_send_message(&mut self, client_txn_id: String, text: String) {
        if let Err(err) = self.validate_transition(&ClientCommand::SendMessage {
            client_txn_id: String::new(),
            text: String::new(),
        }) {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Rejected { error: err },
            ));
            return;
        }

        let Some((conversation_id, peer_id)) = self.active_conversation_ids() else {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Rejected {
                    error: ClientError::validation(
                        "no_active_conversation",
                        "no conversation is active",
                    ),
                },
            ));
            return;
        };
        let identity = match self.require_identity() {
            Ok(identity) => identity,
            Err(err) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Rejected { error: err },
                ));
                return;
            }
        };

        if text.trim().is_empty() {
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                SendOutcome::Rejected {
                    error: ClientError::validation("empty_message", "message text is blank"),
                },
            ));
            return;
        }

        let now = now_ms();
        let draft = MessageDraft {
            sender_id: identity.id.clone(),
            sender_name: identity.display_name.clone(),
            text,
            sent_at_ms: now,
        };

        let outcome = match self
            .context
            .store
            .append_message(&conversation_id, draft)
            .await
        {
            Ok(message_id) => {
                // Best-effort follow-up writes; the append already succeeded
                // and must not be reverted by their failures.
                if let Err(err) = self
                    .context
                    .store
                    .touch_conversation(&conversation_id, now)
                    .await
                {
                    warn!(error = %err, "failed bumping conversation last-updated");
                }
                if let Err(err) = self.context.store.increment_unread(&peer_id, 1).await {
                    warn!(error = %err, "failed bumping peer unread counter");
                }
                self.clear_typing("message sent").await;
                SendOutcome::Accepted { message_id }
            }
            Err(err) => SendOutcome::Rejected {
                error: map_store_error(err),
            },
        };

        self.channels
            .emit(normalize_send_outcome(client_txn_id, outcome));
    }

    async fn handle_delete_message(&mut self, message_id: String) {
        if let Err(err) = self.validate_transition(&ClientCommand::DeleteMessage {
            message_id: String::new(),
        }) {
            self.channels
                .emit(normalize_delete_outcome(message_id, Err(err)));
            return;
        }

        let Some((conversation_id, _)) = self.active_conversation_ids() else {
            self.channels.emit(normalize_delete_outcome(
                message_id,
                Err(ClientError::validation(
                    "no_active_conversation",
                    "no conversation is active",
                )),
            ));
            return;
        };
        let identity = match self.require_identity() {
            Ok(identity) => identity,
            Err(err) => {
                self.channels
                    .emit(normalize_delete_outcome(message_id, Err(err)));
                return;
            }
        };

        // Client-side authorization guard: only the sender may delete, and
        // only messages present in the current feed can be verified.
        let sender = self.conversation.as_ref().and_then(|active| {
            active
                .feed
                .lock()
                .ok()
                .and_then(|feed| feed.sender_of(&message_id).map(ToOwned::to_owned))
        });

        let outcome = match sender {
            None => Err(ClientError::validation(
                "record_not_found",
                format!("message '{message_id}' is not in the current feed"),
            )),
            Some(sender) if sender != identity.id => {
                warn!(%message_id, %sender, "refusing delete of another sender's message");
                Err(ClientError::validation(
                    "not_message_sender",
                    "only the sender may delete a message",
                ))
            }
            Some(_) => self
                .context
                .store
                .delete_message(&conversation_id, &message_id)
                .await
                .map_err(|err| {
                    warn!(error = %err, %message_id, "delete rejected by store");
                    map_store_error(err)
                }),
        };

        self.channels
            .emit(normalize_delete_outcome(message_id, outcome));
    }

    async fn handle_input_activity(&mut self, has_text: bool) {
        if self
            .validate_transition(&ClientCommand::InputActivity { has_text })
            .is_err()
        {
            debug!("ignoring input activity outside an active conversation");
            return;
        }

        if !has_text {
            self.clear_typing("input emptied").await;
            return;
        }

        let Some((conversation_id, _)) = self.active_conversation_ids() else {
            return;
        };
        let Ok(identity) = self.require_identity() else {
            return;
        };

        let record = TypingRecord {
            conversation_id: conversation_id.clone(),
            identity_id: identity.id.clone(),
            is_typing: true,
            updated_at_ms: now_ms(),
        };
        if let Err(err) = self.context.realtime.set_typing(record).await {
            warn!(error = %err, "typing write failed");
        }

        // Re-arm the debounce: the previous pending stop is cancelled so only
        // the newest quiet period produces the stopped write.
        let Some(active) = self.conversation.as_mut() else {
            return;
        };
        if let Some(pending) = active.typing_stop.take() {
            pending.cancel();
        }

        let stop = CancellationToken::new();
        let child = stop.child_token();
        let realtime = self.context.realtime.clone();
        let window = self.config.typing_window;
        let identity_id = identity.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    let stopped = TypingRecord {
                        conversation_id,
                        identity_id,
                        is_typing: false,
                        updated_at_ms: now_ms(),
                    };
                    if let Err(err) = realtime.set_typing(stopped).await {
                        warn!(error = %err, "typing-stopped write failed");
                    }
                }
            }
        });
        active.typing_stop = Some(stop);
    }

    async fn handle_input_blurred(&mut self) {
        if self
            .validate_transition(&ClientCommand::InputBlurred)
            .is_err()
        {
            return;
        }
        self.clear_typing("input blurred").await;
    }

    async fn handle_visibility_changed(&mut self, hidden: bool) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        session.visible.store(!hidden, Ordering::Relaxed);
        let identity_id = session.identity.id.clone();
        self.publish_presence(&identity_id, !hidden, now_ms()).await;
    }

    /// Cancel any pending debounce and write a typing-stopped record now.
    async fn clear_typing(&mut self, reason: &str) {
        let Some(active) = self.conversation.as_mut() else {
            return;
        };
        if let Some(pending) = active.typing_stop.take() {
            pending.cancel();
        }

        let Some(identity) = self.session.as_ref().map(|s| s.identity.id.clone()) else {
            return;
        };
        let record = TypingRecord {
            conversation_id: active.conversation.id.clone(),
            identity_id: identity,
            is_typing: false,
            updated_at_ms: now_ms(),
        };
        if let Err(err) = self.context.realtime.set_typing(record).await {
            warn!(error = %err, reason, "typing clear failed");
        }
    }

    /// Fire-and-forget presence write; failures are logged, never propagated.
    async fn publish_presence(&self, identity_id: &str, online: bool, now: u64) {
        let record = PresenceRecord {
            identity_id: identity_id.to_owned(),
            online,
            last_online_ms: now,
        };
        if let Err(err) = self.context.realtime.set_presence(record).await {
            warn!(error = %err, online, "presence write failed");
        }
    }

    /// Check-then-create; tolerant of the cross-client create race because
    /// the record is idempotently overwritten (participant set is stable,
    /// last-writer-wins on the timestamp).
    async fn ensure_conversation(
        &self,
        own_id: &str,
        peer_id: &str,
    ) -> Result<Conversation, ClientError> {
        let id = conversation_id(own_id, peer_id);
        if let Some(existing) = self
            .context
            .store
            .get_conversation(&id)
            .await
            .map_err(map_store_error)?
        {
            return Ok(existing);
        }

        let conversation = Conversation {
            id: id.clone(),
            participant_ids: participant_ids(own_id, peer_id),
            last_updated_ms: now_ms(),
        };
        self.context
            .store
            .put_conversation(conversation.clone())
            .await
            .map_err(map_store_error)?;
        Ok(conversation)
    }

    fn start_session(&self, identity: Identity) -> ActiveSession {
        let visible = Arc::new(AtomicBool::new(true));
        let stop = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        let child = stop.child_token();
        let realtime = self.context.realtime.clone();
        let identity_id = identity.id.clone();
        let interval = self.config.heartbeat_interval;
        let visible_flag = visible.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        if !visible_flag.load(Ordering::Relaxed) {
                            continue;
                        }
                        let record = PresenceRecord {
                            identity_id: identity_id.clone(),
                            online: true,
                            last_online_ms: now_ms(),
                        };
                        if let Err(err) = realtime.set_presence(record).await {
                            warn!(error = %err, "presence heartbeat write failed");
                        }
                    }
                }
            }
        }));

        tasks.push(self.spawn_self_presence_task(identity.id.clone(), stop.child_token()));

        ActiveSession {
            identity,
            visible,
            stop,
            tasks,
        }
    }

    /// Watch the signed-in identity's own presence path.
    ///
    /// Surfaces writes from any source, including the backend disconnect hook
    /// firing for another tab of the same account.
    fn spawn_self_presence_task(
        &self,
        identity_id: String,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let realtime = self.context.realtime.clone();
        let event_tx = self.channels.event_sender();

        tokio::spawn(async move {
            let mut rx = realtime.watch_presence(&identity_id);
            let initial = rx.borrow_and_update().clone();
            let _ = event_tx.send(ClientEvent::SelfPresence { record: initial });

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let record = rx.borrow_and_update().clone();
                        if stop.is_cancelled() {
                            return;
                        }
                        let _ = event_tx.send(ClientEvent::SelfPresence { record });
                    }
                }
            }
        })
    }

    fn open_subscriptions(&self, conversation: Conversation, peer_id: String) -> ActiveConversation {
        let stop = CancellationToken::new();
        let feed = Arc::new(Mutex::new(MessageFeed::new(conversation.id.clone())));
        let mut tasks = Vec::with_capacity(3);

        tasks.push(self.spawn_feed_task(conversation.id.clone(), feed.clone(), stop.child_token()));
        tasks.push(self.spawn_presence_task(peer_id.clone(), stop.child_token()));
        tasks.push(self.spawn_typing_task(
            conversation.id.clone(),
            peer_id.clone(),
            stop.child_token(),
        ));

        ActiveConversation {
            conversation,
            peer_id,
            feed,
            stop,
            tasks,
            typing_stop: None,
        }
    }

    fn spawn_feed_task(
        &self,
        conversation_id: String,
        feed: Arc<Mutex<MessageFeed>>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.context.store.clone();
        let event_tx = self.channels.event_sender();
        let policy = self.config.feed_retry;

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let (initial, mut rx) = store.subscribe_messages(&conversation_id);
                let _ = event_tx.send(ClientEvent::FeedStatus(FeedStatus {
                    connected: true,
                    retry_hint_ms: None,
                }));
                apply_feed_snapshot(&conversation_id, &feed, initial, &stop, &event_tx);

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        received = rx.recv() => match received {
                            Ok(snapshot) => {
                                attempt = 0;
                                apply_feed_snapshot(
                                    &conversation_id,
                                    &feed,
                                    snapshot,
                                    &stop,
                                    &event_tx,
                                );
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                // Snapshots are self-contained; the next one
                                // fully replaces whatever was missed.
                                debug!(skipped, "feed lagged behind snapshot emissions");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }

                let delay = policy.delay_for_attempt(attempt, None);
                attempt = attempt.saturating_add(1);
                warn!(
                    %conversation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "message feed dropped; scheduling resubscribe"
                );
                let _ = event_tx.send(ClientEvent::FeedStatus(FeedStatus {
                    connected: false,
                    retry_hint_ms: Some(delay.as_millis() as u64),
                }));

                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    fn spawn_presence_task(&self, peer_id: String, stop: CancellationToken) -> JoinHandle<()> {
        let realtime = self.context.realtime.clone();
        let event_tx = self.channels.event_sender();

        tokio::spawn(async move {
            let mut rx = realtime.watch_presence(&peer_id);
            let initial = rx.borrow_and_update().clone();
            let _ = event_tx.send(ClientEvent::PeerPresence {
                peer_id: peer_id.clone(),
                record: initial,
            });

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let record = rx.borrow_and_update().clone();
                        if stop.is_cancelled() {
                            return;
                        }
                        let _ = event_tx.send(ClientEvent::PeerPresence {
                            peer_id: peer_id.clone(),
                            record,
                        });
                    }
                }
            }
        })
    }

    fn spawn_typing_task(
        &self,
        conversation_id: String,
        peer_id: String,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let realtime = self.context.realtime.clone();
        let event_tx = self.channels.event_sender();

        tokio::spawn(async move {
            let mut rx = realtime.watch_typing(&conversation_id, &peer_id);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let record = rx.borrow_and_update().clone();
                        if stop.is_cancelled() {
                            return;
                        }
                        let _ = event_tx.send(ClientEvent::PeerTyping {
                            conversation_id: conversation_id.clone(),
                            peer_id: peer_id.clone(),
                            record,
                        });
                    }
                }
            }
        })
    }

    fn active_conversation_ids(&self) -> Option<(String, String)> {
        self.conversation
            .as_ref()
            .map(|active| (active.conversation.id.clone(), active.peer_id.clone()))
    }

    fn require_identity(&self) -> Result<Identity, ClientError> {
        self.session
            .as_ref()
            .map(|session| session.identity.clone())
            .ok_or_else(|| {
                ClientError::new(
                    ClientErrorCategory::Internal,
                    "session_unavailable",
                    "no authenticated session is available",
                )
            })
    }

    fn validate_transition(
        &self,
        command: &ClientCommand,
    ) -> Result<(SessionStateMachine, Vec<ClientEvent>), ClientError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, candidate: SessionStateMachine, events: Vec<ClientEvent>) {
        self.state_machine = candidate;
        for event in events {
            self.channels.emit(event);
        }
    }

    fn finish_auth(&mut self, success: bool, error: Option<ClientError>) {
        if let Ok(state_event) = self.state_machine.on_auth_result(success) {
            self.channels.emit(state_event);
        }

        self.channels.emit(ClientEvent::AuthResult {
            success,
            error_code: error.as_ref().map(|err| err.code.clone()),
        });
    }

    fn emit_auth_failure(&self, error: ClientError) {
        self.channels.emit(ClientEvent::AuthResult {
            success: false,
            error_code: Some(error.code),
        });
    }
}

fn apply_feed_snapshot(
    conversation_id: &str,
    feed: &Arc<Mutex<MessageFeed>>,
    snapshot: Vec<Message>,
    stop: &CancellationToken,
    event_tx: &broadcast::Sender<ClientEvent>,
) {
    if stop.is_cancelled() {
        return;
    }

    let messages = {
        let Ok(mut feed) = feed.lock() else {
            return;
        };
        if !feed.replace(conversation_id, snapshot) {
            return;
        }
        feed.messages().to_vec()
    };

    let _ = event_tx.send(ClientEvent::MessagesReplaced {
        conversation_id: conversation_id.to_owned(),
        messages,
    });
}

fn map_auth_error(err: AuthError) -> ClientError {
    match err {
        AuthError::Cancelled => ClientError::auth_cancelled(),
        AuthError::Provider(message) => ClientError::auth_provider(message),
    }
}

fn map_store_error(err: StoreError) -> ClientError {
    match err {
        StoreError::NotFound(what) => ClientError::validation(
            "record_not_found",
            format!("referenced record is missing: {what}"),
        ),
        StoreError::Rejected(message) => ClientError::write_rejected(message),
        StoreError::Unavailable(message) => ClientError::new(
            ClientErrorCategory::Network,
            "store_unavailable",
            message,
        ),
        StoreError::Backend(message) => {
            ClientError::new(ClientErrorCategory::Storage, "store_error", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client_backend::{
        InMemoryChatStore, InMemoryPresenceStore, ScriptedAuthProvider, SignInOutcome,
    };
    use client_core::types::SessionLifecycleState;
    use tokio::time::timeout;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            id: id.to_owned(),
            display_name: name.to_owned(),
            email: format!("{name}@example.org"),
            avatar_url: None,
        }
    }

    fn profile(id: &str, name: &str) -> UserProfile {
        UserProfile::from_identity(&identity(id, name), 1_000)
    }

    struct Harness {
        handle: ClientRuntimeHandle,
        events: EventStream,
        store: InMemoryChatStore,
        realtime: InMemoryPresenceStore,
    }

    impl Harness {
        fn spawn(auth: ScriptedAuthProvider, config: RuntimeConfig) -> Self {
            let store = InMemoryChatStore::new();
            let realtime = InMemoryPresenceStore::new();
            let context = ClientContext {
                store: Arc::new(store.clone()),
                realtime: Arc::new(realtime.clone()),
                auth: Arc::new(auth),
            };
            let handle = spawn_runtime(context, config);
            let events = handle.subscribe();
            Self {
                handle,
                events,
                store,
                realtime,
            }
        }

        fn spawn_for(identity: Identity) -> Self {
            Self::spawn(
                ScriptedAuthProvider::always(identity),
                RuntimeConfig::default(),
            )
        }

        async fn send(&self, command: ClientCommand) {
            self.handle
                .send(command)
                .await
                .expect("command should enqueue");
        }

        /// Receive events until the predicate picks one, panicking on timeout.
        async fn wait_for<F>(&mut self, mut pick: F) -> ClientEvent
        where
            F: FnMut(&ClientEvent) -> bool,
        {
            timeout(EVENT_TIMEOUT, async {
                loop {
                    let event = self.events.recv().await.expect("event stream open");
                    if pick(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn sign_in(&mut self) {
            self.send(ClientCommand::SignIn).await;
            let event = self
                .wait_for(|event| matches!(event, ClientEvent::AuthResult { .. }))
                .await;
            match event {
                ClientEvent::AuthResult { success: true, .. } => {}
                other => panic!("sign-in failed: {other:?}"),
            }
        }

        async fn open_conversation(&mut self, peer_id: &str) -> Conversation {
            self.send(ClientCommand::OpenConversation {
                peer_id: peer_id.to_owned(),
            })
            .await;
            let event = self
                .wait_for(|event| matches!(event, ClientEvent::ConversationOpened { .. }))
                .await;
            match event {
                ClientEvent::ConversationOpened { conversation, .. } => conversation,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn sign_in_publishes_presence_and_profile() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness.sign_in().await;

        let record = harness
            .realtime
            .presence_of("u-alice")
            .expect("presence record present");
        assert!(record.online);

        let stored = harness
            .store
            .get_user("u-alice")
            .await
            .expect("get user")
            .expect("profile present");
        assert_eq!(stored.display_name, "Alice");
    }

    #[tokio::test]
    async fn cancelled_sign_in_surfaces_stable_code_and_returns_to_signed_out() {
        let auth = ScriptedAuthProvider::with_outcomes([SignInOutcome::Cancelled]);
        let mut harness = Harness::spawn(auth, RuntimeConfig::default());

        harness.send(ClientCommand::SignIn).await;

        // The machine falls back to signed-out, then the result surfaces.
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::StateChanged {
                        state: SessionLifecycleState::SignedOut
                    }
                )
            })
            .await;

        let event = harness
            .wait_for(|event| matches!(event, ClientEvent::AuthResult { .. }))
            .await;
        match event {
            ClientEvent::AuthResult {
                success,
                error_code,
            } => {
                assert!(!success);
                assert_eq!(error_code.as_deref(), Some("auth_cancelled"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_failure_surfaces_stable_code() {
        let auth = ScriptedAuthProvider::with_outcomes([SignInOutcome::ProviderError(
            "popup blocked".to_owned(),
        )]);
        let mut harness = Harness::spawn(auth, RuntimeConfig::default());

        harness.send(ClientCommand::SignIn).await;
        let event = harness
            .wait_for(|event| matches!(event, ClientEvent::AuthResult { .. }))
            .await;
        match event {
            ClientEvent::AuthResult { error_code, .. } => {
                assert_eq!(error_code.as_deref(), Some("auth_provider_error"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_conversation_creates_the_record_idempotently() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;

        let conversation = harness.open_conversation("u-bob").await;
        assert_eq!(conversation.id, "u-alice#u-bob");
        assert_eq!(
            conversation.participant_ids,
            ["u-alice".to_owned(), "u-bob".to_owned()]
        );

        // Reopening resolves to the same single record.
        let reopened = harness.open_conversation("u-bob").await;
        assert_eq!(reopened.id, conversation.id);
        assert_eq!(reopened.participant_ids, conversation.participant_ids);

        let stored = harness
            .store
            .get_conversation("u-alice#u-bob")
            .await
            .expect("get conversation")
            .expect("record present");
        assert_eq!(stored.participant_ids, conversation.participant_ids);
    }

    #[tokio::test]
    async fn send_appends_and_both_sides_observe_it() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        // The peer's independent subscription over the same conversation id.
        let (_, mut peer_feed) = harness.store.subscribe_messages(&conversation.id);

        harness
            .send(ClientCommand::SendMessage {
                client_txn_id: "txn-1".to_owned(),
                text: "hello".to_owned(),
            })
            .await;

        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::SendAck(_)))
            .await;
        let message_id = match ack {
            ClientEvent::SendAck(ack) => {
                assert_eq!(ack.error_code, None);
                ack.message_id.expect("message id assigned")
            }
            other => panic!("unexpected event: {other:?}"),
        };

        let replaced = harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::MessagesReplaced { messages, .. } if !messages.is_empty()
                )
            })
            .await;
        match replaced {
            ClientEvent::MessagesReplaced {
                conversation_id,
                messages,
            } => {
                assert_eq!(conversation_id, conversation.id);
                let last = messages.last().expect("message present");
                assert_eq!(last.id, message_id);
                assert_eq!(last.text, "hello");
                assert_eq!(last.sender_id, "u-alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let peer_snapshot = timeout(EVENT_TIMEOUT, peer_feed.recv())
            .await
            .expect("peer feed timeout")
            .expect("peer feed open");
        assert_eq!(peer_snapshot.len(), 1);
        assert_eq!(peer_snapshot[0].text, "hello");

        let updated = harness
            .store
            .get_conversation(&conversation.id)
            .await
            .expect("get conversation")
            .expect("record present");
        assert!(updated.last_updated_ms >= conversation.last_updated_ms);

        let bob = harness
            .store
            .get_user("u-bob")
            .await
            .expect("get user")
            .expect("profile present");
        assert_eq!(bob.unread_count, 1);
    }

    #[tokio::test]
    async fn blank_send_is_a_no_op() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        harness
            .send(ClientCommand::SendMessage {
                client_txn_id: "txn-blank".to_owned(),
                text: "   ".to_owned(),
            })
            .await;

        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::SendAck(_)))
            .await;
        match ack {
            ClientEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("empty_message"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(harness.store.messages_of(&conversation.id).is_empty());
    }

    #[tokio::test]
    async fn delete_own_message_removes_it_for_both_sides() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        harness
            .send(ClientCommand::SendMessage {
                client_txn_id: "txn-1".to_owned(),
                text: "hello".to_owned(),
            })
            .await;
        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::SendAck(_)))
            .await;
        let message_id = match ack {
            ClientEvent::SendAck(ack) => ack.message_id.expect("message id assigned"),
            other => panic!("unexpected event: {other:?}"),
        };
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::MessagesReplaced { messages, .. } if !messages.is_empty()
                )
            })
            .await;

        let (_, mut peer_feed) = harness.store.subscribe_messages(&conversation.id);
        harness
            .send(ClientCommand::DeleteMessage {
                message_id: message_id.clone(),
            })
            .await;

        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::DeleteAck(_)))
            .await;
        match ack {
            ClientEvent::DeleteAck(ack) => assert_eq!(ack.error_code, None),
            other => panic!("unexpected event: {other:?}"),
        }

        let peer_snapshot = timeout(EVENT_TIMEOUT, peer_feed.recv())
            .await
            .expect("peer feed timeout")
            .expect("peer feed open");
        assert!(peer_snapshot.iter().all(|message| message.id != message_id));
        assert!(harness.store.messages_of(&conversation.id).is_empty());
    }

    #[tokio::test]
    async fn foreign_message_delete_is_refused_client_side() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        // Bob's message arrives through the backend directly.
        let foreign_id = harness
            .store
            .append_message(
                &conversation.id,
                MessageDraft {
                    sender_id: "u-bob".to_owned(),
                    sender_name: "Bob".to_owned(),
                    text: "mine".to_owned(),
                    sent_at_ms: now_ms(),
                },
            )
            .await
            .expect("seed foreign message");
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::MessagesReplaced { messages, .. } if !messages.is_empty()
                )
            })
            .await;

        harness
            .send(ClientCommand::DeleteMessage {
                message_id: foreign_id.clone(),
            })
            .await;

        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::DeleteAck(_)))
            .await;
        match ack {
            ClientEvent::DeleteAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("not_message_sender"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(harness.store.messages_of(&conversation.id).len(), 1);
    }

    #[tokio::test]
    async fn switching_conversations_drops_the_previous_feed() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed bob");
        harness
            .store
            .upsert_user(profile("u-carol", "Carol"))
            .await
            .expect("seed carol");
        harness.sign_in().await;

        let old = harness.open_conversation("u-bob").await;
        // Drain the first feed's initial snapshot before switching.
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::MessagesReplaced { conversation_id, .. }
                        if *conversation_id == old.id
                )
            })
            .await;

        let new = harness.open_conversation("u-carol").await;
        assert_ne!(old.id, new.id);

        // A message lands in the old conversation after the switch.
        harness
            .store
            .append_message(
                &old.id,
                MessageDraft {
                    sender_id: "u-bob".to_owned(),
                    sender_name: "Bob".to_owned(),
                    text: "late".to_owned(),
                    sent_at_ms: now_ms(),
                },
            )
            .await
            .expect("append to old conversation");

        // No snapshot for the old conversation may surface anymore.
        let outcome = timeout(Duration::from_millis(200), async {
            loop {
                let event = harness.events.recv().await.expect("event stream open");
                if let ClientEvent::MessagesReplaced {
                    conversation_id, ..
                } = &event
                    && conversation_id == &old.id
                {
                    return event;
                }
            }
        })
        .await;
        assert!(outcome.is_err(), "stale feed event leaked: {outcome:?}");
    }

    #[tokio::test]
    async fn sign_out_marks_presence_offline() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness.sign_in().await;

        harness.send(ClientCommand::SignOut).await;
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::AuthStateChanged { identity: None }
                )
            })
            .await;

        let record = harness
            .realtime
            .presence_of("u-alice")
            .expect("presence record present");
        assert!(!record.online);
    }

    #[tokio::test]
    async fn disconnect_hook_marks_presence_offline() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness.sign_in().await;

        // The client observes its own record through the session watch.
        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::SelfPresence {
                        record: Some(record)
                    } if record.online
                )
            })
            .await;

        harness.realtime.fire_disconnect("u-alice");

        harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::SelfPresence {
                        record: Some(record)
                    } if !record.online
                )
            })
            .await;

        let record = harness
            .realtime
            .presence_of("u-alice")
            .expect("presence record present");
        assert!(!record.online);
    }

    #[tokio::test]
    async fn typing_publishes_and_debounce_stops_it() {
        let config = RuntimeConfig {
            typing_window: Duration::from_millis(50),
            ..RuntimeConfig::default()
        };
        let auth = ScriptedAuthProvider::always(identity("u-alice", "Alice"));
        let mut harness = Harness::spawn(auth, config);
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        harness
            .send(ClientCommand::InputActivity { has_text: true })
            .await;

        let mut typing = harness.realtime.watch_typing(&conversation.id, "u-alice");
        timeout(EVENT_TIMEOUT, async {
            loop {
                if typing
                    .borrow()
                    .as_ref()
                    .is_some_and(|record| record.is_typing)
                {
                    return;
                }
                typing.changed().await.expect("typing path open");
            }
        })
        .await
        .expect("typing record should appear");

        // No further activity: the debounce writes the stopped record.
        timeout(EVENT_TIMEOUT, async {
            loop {
                typing.changed().await.expect("typing path open");
                if typing
                    .borrow()
                    .as_ref()
                    .is_some_and(|record| !record.is_typing)
                {
                    return;
                }
            }
        })
        .await
        .expect("debounce should stop typing");
    }

    #[tokio::test]
    async fn sending_clears_typing_immediately() {
        let config = RuntimeConfig {
            typing_window: Duration::from_secs(60),
            ..RuntimeConfig::default()
        };
        let auth = ScriptedAuthProvider::always(identity("u-alice", "Alice"));
        let mut harness = Harness::spawn(auth, config);
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        harness
            .send(ClientCommand::InputActivity { has_text: true })
            .await;
        harness
            .send(ClientCommand::SendMessage {
                client_txn_id: "txn-1".to_owned(),
                text: "hello".to_owned(),
            })
            .await;
        harness
            .wait_for(|event| matches!(event, ClientEvent::SendAck(_)))
            .await;

        let record = harness
            .realtime
            .typing_of(&conversation.id, "u-alice")
            .expect("typing record present");
        assert!(!record.is_typing);
    }

    #[tokio::test]
    async fn peer_presence_and_typing_flow_through_events() {
        let mut harness = Harness::spawn_for(identity("u-alice", "Alice"));
        harness
            .store
            .upsert_user(profile("u-bob", "Bob"))
            .await
            .expect("seed peer");
        harness.sign_in().await;
        let conversation = harness.open_conversation("u-bob").await;

        harness
            .realtime
            .set_presence(PresenceRecord {
                identity_id: "u-bob".to_owned(),
                online: true,
                last_online_ms: now_ms(),
            })
            .await
            .expect("peer presence write");

        let presence = harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::PeerPresence {
                        record: Some(record),
                        ..
                    } if record.online
                )
            })
            .await;
        match presence {
            ClientEvent::PeerPresence { peer_id, .. } => assert_eq!(peer_id, "u-bob"),
            other => panic!("unexpected event: {other:?}"),
        }

        harness
            .realtime
            .set_typing(TypingRecord {
                conversation_id: conversation.id.clone(),
                identity_id: "u-bob".to_owned(),
                is_typing: true,
                updated_at_ms: now_ms(),
            })
            .await
            .expect("peer typing write");

        let typing = harness
            .wait_for(|event| {
                matches!(
                    event,
                    ClientEvent::PeerTyping {
                        record: Some(record),
                        ..
                    } if record.is_typing
                )
            })
            .await;
        match typing {
            ClientEvent::PeerTyping {
                conversation_id, ..
            } => assert_eq!(conversation_id, conversation.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_outside_authenticated_context_are_rejected() {
        let auth = ScriptedAuthProvider::always(identity("u-alice", "Alice"));
        let mut harness = Harness::spawn(auth, RuntimeConfig::default());

        harness
            .send(ClientCommand::SendMessage {
                client_txn_id: "txn-early".to_owned(),
                text: "hello".to_owned(),
            })
            .await;
        let ack = harness
            .wait_for(|event| matches!(event, ClientEvent::SendAck(_)))
            .await;
        match ack {
            ClientEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("invalid_state_transition"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        harness
            .send(ClientCommand::OpenConversation {
                peer_id: "u-bob".to_owned(),
            })
            .await;
        let fatal = harness
            .wait_for(|event| matches!(event, ClientEvent::FatalError { .. }))
            .await;
        match fatal {
            ClientEvent::FatalError { code, .. } => {
                assert_eq!(code, "invalid_state_transition");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
