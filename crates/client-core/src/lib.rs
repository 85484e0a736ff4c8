//! Core client contract shared between the runtime and frontend consumers.
//!
//! This crate defines the command/event protocol, session lifecycle model,
//! conversation resolution, feed and presence rules, and common
//! error/channel abstractions.

/// Async command/event channel primitives.
pub mod channel;
/// Deterministic conversation id derivation and participant helpers.
pub mod conversation;
/// Stable client error types.
pub mod error;
/// Message feed snapshot buffer.
pub mod feed;
/// Event normalization helpers (send/delete acknowledgements).
pub mod normalization;
/// Presence liveness and typing freshness rules.
pub mod presence;
/// Backoff policy used by resubscribe loops.
pub mod retry;
/// Session lifecycle state machine.
pub mod state_machine;
/// Protocol types (commands, events, records).
pub mod types;

pub use channel::{ClientChannelError, ClientChannels, EventStream};
pub use conversation::{
    CONVERSATION_ID_SEPARATOR, conversation_id, participant_ids, peer_of, validate_peer_id,
};
pub use error::{ClientError, ClientErrorCategory};
pub use feed::{MessageFeed, normalize_snapshot};
pub use normalization::{
    SendOutcome, normalize_delete_outcome, normalize_fatal_error, normalize_send_outcome,
};
pub use presence::{
    HEARTBEAT_INTERVAL_MS, PeerLiveness, TYPING_STALE_AFTER_MS, typing_indicator_visible,
};
pub use retry::RetryPolicy;
pub use state_machine::SessionStateMachine;
pub use types::{
    ClientCommand, ClientEvent, Conversation, DeleteAck, FeedStatus, Identity, Message,
    MessageDraft, PresenceRecord, SendAck, SessionLifecycleState, TypingRecord, UserProfile,
};
