use serde::{Deserialize, Serialize};

/// High-level session lifecycle state reported to consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// No authenticated identity is present.
    SignedOut,
    /// An interactive sign-in flow is currently running.
    Authenticating,
    /// An identity is authenticated; no conversation is open.
    SignedIn,
    /// An identity is authenticated and a conversation is active.
    Conversing,
    /// Runtime entered unrecoverable fatal state.
    Fatal,
}

/// Authenticated end-user identity as returned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Opaque stable identity id.
    pub id: String,
    /// Provider-supplied display name.
    pub display_name: String,
    /// Provider-supplied email address.
    pub email: String,
    /// Optional avatar URL; `None` renders a placeholder.
    pub avatar_url: Option<String>,
}

/// User directory record stored in the document store.
///
/// Re-upserted on every sign-in; `unread_count` is a best-effort counter
/// bumped by peers when they send to this user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    /// Opaque stable identity id.
    pub id: String,
    /// Display name, also the search key for user lookup.
    pub display_name: String,
    /// Email address.
    pub email: String,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
    /// Best-effort unread message counter.
    pub unread_count: u64,
    /// Last sign-in timestamp in milliseconds since Unix epoch.
    pub last_active_ms: u64,
}

impl UserProfile {
    /// Build a fresh directory record from a provider identity.
    pub fn from_identity(identity: &Identity, now_ms: u64) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            email: identity.email.clone(),
            avatar_url: identity.avatar_url.clone(),
            unread_count: 0,
            last_active_ms: now_ms,
        }
    }
}

/// Durable 1:1 thread container between two identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Deterministic id derived from both participant ids.
    pub id: String,
    /// Both participant ids in lexicographic order.
    pub participant_ids: [String; 2],
    /// Timestamp of the most recent message, milliseconds since Unix epoch.
    pub last_updated_ms: u64,
}

/// One message inside a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Backend-assigned message id, unique within the conversation.
    pub id: String,
    /// Owning conversation id.
    pub conversation_id: String,
    /// Sender identity id.
    pub sender_id: String,
    /// Sender display name denormalized at send time.
    pub sender_name: String,
    /// Message body.
    pub text: String,
    /// Send timestamp in milliseconds since Unix epoch; primary ordering key.
    pub sent_at_ms: u64,
    /// Read receipt flag; false on append.
    pub read: bool,
}

/// Message payload before the backend assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    /// Sender identity id.
    pub sender_id: String,
    /// Sender display name.
    pub sender_name: String,
    /// Message body.
    pub text: String,
    /// Send timestamp in milliseconds since Unix epoch.
    pub sent_at_ms: u64,
}

/// Liveness record for one identity, overwritten in place by its own client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Record owner.
    pub identity_id: String,
    /// Whether the owning client currently considers itself online.
    pub online: bool,
    /// Last time the record was written, milliseconds since Unix epoch.
    pub last_online_ms: u64,
}

/// Ephemeral typing signal keyed by (conversation, sender).
///
/// Consumers must treat a record older than the staleness window as
/// not-typing even without an explicit stopped write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingRecord {
    /// Conversation the typing happens in.
    pub conversation_id: String,
    /// Identity that is typing.
    pub identity_id: String,
    /// Whether the sender is actively composing.
    pub is_typing: bool,
    /// Timestamp of the write, milliseconds since Unix epoch.
    pub updated_at_ms: u64,
}

/// Command channel input accepted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientCommand {
    /// Run the interactive sign-in flow.
    SignIn,
    /// Mark presence offline, then invalidate the provider session.
    SignOut,
    /// Prefix-search the user directory by display name.
    SearchUsers {
        /// Raw query text; blank yields empty results without a store call.
        query: String,
    },
    /// Resolve/create the conversation with a peer and open its feeds.
    OpenConversation {
        /// Peer identity id.
        peer_id: String,
    },
    /// Tear down the active conversation's subscriptions.
    CloseConversation,
    /// Append a message to the active conversation.
    SendMessage {
        /// Caller-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
        /// Message body; blank after trim is rejected.
        text: String,
    },
    /// Delete one of the caller's own messages from the active conversation.
    DeleteMessage {
        /// Target message id.
        message_id: String,
    },
    /// Keystroke/composition activity in the message input.
    InputActivity {
        /// Whether the input currently holds non-empty text.
        has_text: bool,
    },
    /// The message input lost focus.
    InputBlurred,
    /// The hosting view was hidden or shown.
    VisibilityChanged {
        /// `true` when the view became hidden.
        hidden: bool,
    },
}

/// Acknowledgement for `SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Caller transaction id echoed back verbatim.
    pub client_txn_id: String,
    /// Backend-assigned message id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Acknowledgement for `DeleteMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteAck {
    /// Target message id.
    pub message_id: String,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Health of the active conversation's live message feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedStatus {
    /// Whether the feed subscription is currently delivering.
    pub connected: bool,
    /// Optional hint about the next resubscribe delay.
    pub retry_hint_ms: Option<u64>,
}

/// Event channel output emitted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientEvent {
    /// Session lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: SessionLifecycleState,
    },
    /// Push-based current-identity update.
    AuthStateChanged {
        /// Authenticated identity, or `None` after sign-out.
        identity: Option<Identity>,
    },
    /// Result of the interactive sign-in flow.
    AuthResult {
        /// `true` when sign-in completed successfully.
        success: bool,
        /// Stable error code when `success == false`.
        error_code: Option<String>,
    },
    /// User directory search results.
    SearchResults {
        /// Query the results answer.
        query: String,
        /// Matching directory records.
        users: Vec<UserProfile>,
    },
    /// Authoritative conversations-containing-me listing.
    RecentConversations {
        /// Conversations, most recently updated first.
        conversations: Vec<Conversation>,
    },
    /// A conversation was resolved and its subscriptions opened.
    ConversationOpened {
        /// The resolved conversation record.
        conversation: Conversation,
        /// Directory record of the peer.
        peer: UserProfile,
    },
    /// The active conversation was closed and its subscriptions cancelled.
    ConversationClosed,
    /// Full snapshot replacement of the active conversation's messages.
    MessagesReplaced {
        /// Owning conversation id; consumers must drop mismatching snapshots.
        conversation_id: String,
        /// Messages in display order.
        messages: Vec<Message>,
    },
    /// Latest presence record for the signed-in identity itself.
    SelfPresence {
        /// Current record; `None` while no record exists yet.
        record: Option<PresenceRecord>,
    },
    /// Latest presence record for the watched peer.
    PeerPresence {
        /// Watched peer id.
        peer_id: String,
        /// Current record; `None` while no record exists yet.
        record: Option<PresenceRecord>,
    },
    /// Latest typing record for the watched peer.
    PeerTyping {
        /// Conversation the signal belongs to.
        conversation_id: String,
        /// Watched peer id.
        peer_id: String,
        /// Current record; `None` while no record exists yet.
        record: Option<TypingRecord>,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Delete acknowledgement.
    DeleteAck(DeleteAck),
    /// Feed connectivity update.
    FeedStatus(FeedStatus),
    /// Fatal runtime error.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
