use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use client_core::types::{Conversation, Message, MessageDraft, UserProfile};

const FEED_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by document store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// The write was rejected by a permission or validation rule.
    #[error("write rejected: {0}")]
    Rejected(String),
    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store backend failed internally.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Document store contract consumed by the client runtime.
///
/// Live message subscriptions have snapshot semantics: every change to a
/// conversation's messages re-emits the full ordered result set, never a
/// diff, and a fresh subscription sees the current contents immediately.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create or overwrite a user directory record.
    async fn upsert_user(&self, profile: UserProfile) -> Result<(), StoreError>;

    /// Fetch a user directory record by id.
    async fn get_user(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Prefix-search the directory by display name, ordered by display name.
    async fn search_users(&self, display_name_prefix: &str)
    -> Result<Vec<UserProfile>, StoreError>;

    /// Best-effort bump of a user's unread counter.
    async fn increment_unread(&self, identity_id: &str, delta: u64) -> Result<(), StoreError>;

    /// Fetch a conversation record by id.
    async fn get_conversation(&self, conversation_id: &str)
    -> Result<Option<Conversation>, StoreError>;

    /// Create or overwrite a conversation record.
    async fn put_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Bump a conversation's last-updated timestamp.
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_updated_ms: u64,
    ) -> Result<(), StoreError>;

    /// Conversations containing the given identity, most recent first.
    async fn conversations_for(&self, identity_id: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Append a message; the store assigns and returns its id.
    async fn append_message(
        &self,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<String, StoreError>;

    /// Delete a message by id.
    ///
    /// Sender-ship is NOT verified here; that guard is client-side.
    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError>;

    /// Open a live snapshot subscription over a conversation's messages.
    ///
    /// Returns the current ordered contents plus a stream of full-snapshot
    /// re-emissions.
    fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> (Vec<Message>, broadcast::Receiver<Vec<Message>>);
}

#[derive(Debug)]
struct MessageSlot {
    messages: Vec<Message>,
    next_seq: u64,
    feed_tx: broadcast::Sender<Vec<Message>>,
}

impl Default for MessageSlot {
    fn default() -> Self {
        let (feed_tx, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Self {
            messages: Vec::new(),
            next_seq: 1,
            feed_tx,
        }
    }
}

impl MessageSlot {
    fn ordered_messages(&self) -> Vec<Message> {
        let mut ordered = self.messages.clone();
        ordered.sort_by(|a, b| {
            a.sent_at_ms
                .cmp(&b.sent_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }

    fn emit_snapshot(&self) {
        let _ = self.feed_tx.send(self.ordered_messages());
    }
}

/// In-memory document store with faithful snapshot-subscription semantics.
///
/// Backs the runtime integration tests and the shell's local mode.
#[derive(Clone, Default)]
pub struct InMemoryChatStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    users: HashMap<String, UserProfile>,
    conversations: HashMap<String, Conversation>,
    slots: HashMap<String, MessageSlot>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))
    }

    /// Current ordered messages of a conversation, for test assertions.
    pub fn messages_of(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .slots
                    .get(conversation_id)
                    .map(MessageSlot::ordered_messages)
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn upsert_user(&self, profile: UserProfile) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.users.insert(profile.id.clone(), profile);
        Ok(())
    }

    async fn get_user(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.users.get(identity_id).cloned())
    }

    async fn search_users(
        &self,
        display_name_prefix: &str,
    ) -> Result<Vec<UserProfile>, StoreError> {
        let inner = self.lock()?;
        let mut matches: Vec<UserProfile> = inner
            .users
            .values()
            .filter(|user| user.display_name.starts_with(display_name_prefix))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(matches)
    }

    async fn increment_unread(&self, identity_id: &str, delta: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let user = inner
            .users
            .get_mut(identity_id)
            .ok_or_else(|| StoreError::NotFound(format!("user '{identity_id}'")))?;
        user.unread_count = user.unread_count.saturating_add(delta);
        Ok(())
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.conversations.get(conversation_id).cloned())
    }

    async fn put_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .conversations
            .insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_updated_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation '{conversation_id}'")))?;
        conversation.last_updated_ms = last_updated_ms;
        Ok(())
    }

    async fn conversations_for(&self, identity_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.lock()?;
        let mut matches: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|conversation| {
                conversation
                    .participant_ids
                    .iter()
                    .any(|participant| participant == identity_id)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.last_updated_ms.cmp(&a.last_updated_ms));
        Ok(matches)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(StoreError::NotFound(format!(
                "conversation '{conversation_id}'"
            )));
        }

        let slot = inner.slots.entry(conversation_id.to_owned()).or_default();
        let message_id = format!("m-{:06}", slot.next_seq);
        slot.next_seq += 1;
        slot.messages.push(Message {
            id: message_id.clone(),
            conversation_id: conversation_id.to_owned(),
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            text: draft.text,
            sent_at_ms: draft.sent_at_ms,
            read: false,
        });
        slot.emit_snapshot();
        Ok(message_id)
    }

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let slot = inner
            .slots
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation '{conversation_id}'")))?;
        let index = slot
            .messages
            .iter()
            .position(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message '{message_id}'")))?;
        slot.messages.remove(index);
        slot.emit_snapshot();
        Ok(())
    }

    fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> (Vec<Message>, broadcast::Receiver<Vec<Message>>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = inner.slots.entry(conversation_id.to_owned()).or_default();
        (slot.ordered_messages(), slot.feed_tx.subscribe())
    }
}
