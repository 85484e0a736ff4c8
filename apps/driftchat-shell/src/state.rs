//! View-state reducer for the shell.
//!
//! Consumes runtime events into a renderable snapshot. Render-time concerns
//! that the runtime deliberately leaves to consumers live here: the typing
//! staleness check, the stale-conversation event guard, and draft
//! preservation across failed sends.

use std::collections::HashMap;

use client_core::{
    PeerLiveness, typing_indicator_visible,
    types::{
        ClientEvent, Conversation, DeleteAck, FeedStatus, Identity, Message, PresenceRecord,
        SendAck, SessionLifecycleState, TypingRecord, UserProfile,
    },
};
use tracing::{debug, warn};

const DEFAULT_STATUS: &str = "Signed out";

/// Message row consumed by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub sender_name: String,
    pub text: String,
    pub sent_at_ms: u64,
    pub is_own: bool,
}

/// Full view snapshot emitted after state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSnapshot {
    pub status_text: String,
    pub error_text: Option<String>,
    pub signed_in_as: Option<String>,
    pub self_status: String,
    pub active_peer: Option<String>,
    pub peer_status: String,
    pub messages: Vec<MessageRow>,
    pub draft: String,
    pub emoji_picker_open: bool,
    pub can_send: bool,
    pub feed_connected: bool,
    pub search_results: Vec<UserProfile>,
    pub recent_conversations: Vec<Conversation>,
}

#[derive(Debug, Clone)]
struct ActiveView {
    conversation_id: String,
    peer: UserProfile,
}

/// Mutable view state that receives runtime events and user edits.
#[derive(Debug, Clone)]
pub struct ShellState {
    typing_stale_after_ms: u64,
    lifecycle: SessionLifecycleState,
    identity: Option<Identity>,
    status_text: String,
    error_text: Option<String>,
    search_results: Vec<UserProfile>,
    recent_conversations: Vec<Conversation>,
    recent_authoritative: bool,
    active: Option<ActiveView>,
    messages: Vec<Message>,
    self_presence: Option<PresenceRecord>,
    peer_presence: Option<PresenceRecord>,
    peer_typing: Option<TypingRecord>,
    draft: String,
    pending_sends: HashMap<String, String>,
    emoji_picker_open: bool,
    feed_connected: bool,
}

impl ShellState {
    pub fn new(typing_stale_after_ms: u64) -> Self {
        Self {
            typing_stale_after_ms: typing_stale_after_ms.max(1),
            lifecycle: SessionLifecycleState::SignedOut,
            identity: None,
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            search_results: Vec::new(),
            recent_conversations: Vec::new(),
            recent_authoritative: false,
            active: None,
            messages: Vec::new(),
            self_presence: None,
            peer_presence: None,
            peer_typing: None,
            draft: String::new(),
            pending_sends: HashMap::new(),
            emoji_picker_open: false,
            feed_connected: false,
        }
    }

    /// Pre-populate the recent list from the local cache file.
    ///
    /// A non-authoritative hint only: dropped as soon as the live query
    /// result arrives, and never applied on top of it.
    pub fn prime_recent_cache(&mut self, conversations: Vec<Conversation>) {
        if self.recent_authoritative {
            return;
        }
        debug!(
            count = conversations.len(),
            "primed recent conversations from local cache"
        );
        self.recent_conversations = conversations;
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|view| view.conversation_id.as_str())
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn toggle_emoji_picker(&mut self) {
        self.emoji_picker_open = !self.emoji_picker_open;
    }

    /// Record an in-flight send so the draft can be resolved by its ack.
    pub fn begin_send(&mut self, client_txn_id: impl Into<String>) {
        self.pending_sends
            .insert(client_txn_id.into(), self.draft.clone());
    }

    /// Feed one runtime event into the reducer.
    pub fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::StateChanged { state } => {
                self.lifecycle = state;
                self.status_text = lifecycle_label(state).to_owned();
                if state == SessionLifecycleState::SignedOut {
                    self.reset_session_view();
                }
            }
            ClientEvent::AuthStateChanged { identity } => {
                if identity.is_none() {
                    self.reset_session_view();
                }
                self.identity = identity;
            }
            ClientEvent::AuthResult {
                success,
                error_code,
            } => {
                if success {
                    self.error_text = None;
                } else {
                    let code = error_code.unwrap_or_else(|| "unknown".to_owned());
                    self.error_text = Some(auth_error_text(&code));
                }
            }
            ClientEvent::SearchResults { users, .. } => {
                self.search_results = users;
            }
            ClientEvent::RecentConversations { conversations } => {
                self.recent_authoritative = true;
                self.recent_conversations = conversations;
            }
            ClientEvent::ConversationOpened { conversation, peer } => {
                self.active = Some(ActiveView {
                    conversation_id: conversation.id,
                    peer,
                });
                self.messages.clear();
                self.peer_presence = None;
                self.peer_typing = None;
                self.feed_connected = false;
            }
            ClientEvent::ConversationClosed => {
                self.active = None;
                self.messages.clear();
                self.peer_presence = None;
                self.peer_typing = None;
            }
            ClientEvent::MessagesReplaced {
                conversation_id,
                messages,
            } => {
                // Guard against late emissions from a cancelled subscription.
                if self.active_conversation_id() != Some(conversation_id.as_str()) {
                    warn!(
                        %conversation_id,
                        "dropping message snapshot for inactive conversation"
                    );
                    return;
                }
                self.messages = messages;
            }
            ClientEvent::SelfPresence { record } => {
                self.self_presence = record;
            }
            ClientEvent::PeerPresence { peer_id, record } => {
                if self
                    .active
                    .as_ref()
                    .is_some_and(|view| view.peer.id == peer_id)
                {
                    self.peer_presence = record;
                }
            }
            ClientEvent::PeerTyping {
                conversation_id,
                peer_id,
                record,
            } => {
                let matches_view = self.active.as_ref().is_some_and(|view| {
                    view.conversation_id == conversation_id && view.peer.id == peer_id
                });
                if matches_view {
                    self.peer_typing = record;
                }
            }
            ClientEvent::SendAck(ack) => self.handle_send_ack(ack),
            ClientEvent::DeleteAck(ack) => self.handle_delete_ack(ack),
            ClientEvent::FeedStatus(FeedStatus {
                connected,
                retry_hint_ms,
            }) => {
                self.feed_connected = connected;
                if !connected {
                    self.status_text = match retry_hint_ms {
                        Some(hint) => format!("Feed disconnected (retry in {hint} ms)"),
                        None => "Feed disconnected".to_owned(),
                    };
                } else if self.lifecycle == SessionLifecycleState::Conversing {
                    self.status_text = lifecycle_label(self.lifecycle).to_owned();
                }
            }
            ClientEvent::FatalError { code, message, .. } => {
                warn!(%code, %message, "runtime error surfaced to view state");
                self.error_text = Some(format!("{code}: {message}"));
            }
        }
    }

    /// Current immutable snapshot for rendering.
    ///
    /// `now_ms` drives the typing staleness rule, so an unrefreshed typing
    /// record disappears on the next render without any event arriving.
    pub fn snapshot(&self, now_ms: u64) -> ShellSnapshot {
        let own_id = self.identity.as_ref().map(|identity| identity.id.as_str());
        let messages = self
            .messages
            .iter()
            .map(|message| MessageRow {
                id: message.id.clone(),
                sender_name: message.sender_name.clone(),
                text: message.text.clone(),
                sent_at_ms: message.sent_at_ms,
                is_own: Some(message.sender_id.as_str()) == own_id,
            })
            .collect();

        ShellSnapshot {
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            signed_in_as: self
                .identity
                .as_ref()
                .map(|identity| identity.display_name.clone()),
            self_status: match PeerLiveness::from_record(self.self_presence.as_ref()) {
                PeerLiveness::Online => "online".to_owned(),
                PeerLiveness::Offline { .. } => "offline".to_owned(),
                PeerLiveness::Unknown => "unknown".to_owned(),
            },
            active_peer: self
                .active
                .as_ref()
                .map(|view| view.peer.display_name.clone()),
            peer_status: self.peer_status_label(now_ms),
            messages,
            draft: self.draft.clone(),
            emoji_picker_open: self.emoji_picker_open,
            can_send: self.active.is_some() && self.identity.is_some(),
            feed_connected: self.feed_connected,
            search_results: self.search_results.clone(),
            recent_conversations: self.recent_conversations.clone(),
        }
    }

    fn handle_send_ack(&mut self, ack: SendAck) {
        let pending = self.pending_sends.remove(&ack.client_txn_id);
        if let Some(error_code) = ack.error_code {
            warn!(
                client_txn_id = %ack.client_txn_id,
                error_code = %error_code,
                "send acknowledgement reported failure"
            );
            // Draft stays in place so nothing typed is lost.
            if let Some(text) = pending
                && self.draft.is_empty()
            {
                self.draft = text;
            }
            self.error_text = Some(format!("send failed ({error_code})"));
        } else {
            debug!(client_txn_id = %ack.client_txn_id, "send acknowledged");
            self.draft.clear();
            self.emoji_picker_open = false;
            self.error_text = None;
        }
    }

    fn handle_delete_ack(&mut self, ack: DeleteAck) {
        if let Some(error_code) = ack.error_code {
            warn!(
                message_id = %ack.message_id,
                error_code = %error_code,
                "delete acknowledgement reported failure"
            );
            self.error_text = Some(format!("delete failed ({error_code})"));
        }
    }

    fn peer_status_label(&self, now_ms: u64) -> String {
        if self.active.is_none() {
            return "no conversation".to_owned();
        }

        if typing_indicator_visible(self.peer_typing.as_ref(), now_ms, self.typing_stale_after_ms)
        {
            return "typing...".to_owned();
        }

        match PeerLiveness::from_record(self.peer_presence.as_ref()) {
            PeerLiveness::Unknown => "unknown".to_owned(),
            PeerLiveness::Online => "online".to_owned(),
            PeerLiveness::Offline { last_online_ms } => {
                format!("last seen at {last_online_ms} ms")
            }
        }
    }

    fn reset_session_view(&mut self) {
        self.identity = None;
        self.active = None;
        self.messages.clear();
        self.self_presence = None;
        self.peer_presence = None;
        self.peer_typing = None;
        self.search_results.clear();
        self.recent_conversations.clear();
        self.recent_authoritative = false;
        self.draft.clear();
        self.pending_sends.clear();
        self.emoji_picker_open = false;
        self.feed_connected = false;
    }
}

fn lifecycle_label(state: SessionLifecycleState) -> &'static str {
    match state {
        SessionLifecycleState::SignedOut => "Signed out",
        SessionLifecycleState::Authenticating => "Signing in",
        SessionLifecycleState::SignedIn => "Signed in",
        SessionLifecycleState::Conversing => "In conversation",
        SessionLifecycleState::Fatal => "Fatal",
    }
}

fn auth_error_text(code: &str) -> String {
    match code {
        "auth_cancelled" => "sign-in was cancelled; try again".to_owned(),
        "auth_provider_error" => {
            "the identity provider is unavailable; try again later".to_owned()
        }
        other => format!("sign-in failed ({other})"),
    }
}
