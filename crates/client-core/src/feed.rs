use std::collections::HashSet;

use crate::types::Message;

/// In-memory view of one conversation's message list.
///
/// Fed by full-snapshot emissions; every `replace` rebuilds the list rather
/// than applying diffs. Rendering order is `(sent_at_ms, id)` ascending and
/// duplicate ids across emissions collapse to their latest instance.
#[derive(Debug, Clone)]
pub struct MessageFeed {
    conversation_id: String,
    messages: Vec<Message>,
}

impl MessageFeed {
    /// Create an empty feed bound to one conversation.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
        }
    }

    /// Conversation this feed belongs to.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Newest message in display order, when present.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Sender of a message currently in the feed.
    pub fn sender_of(&self, message_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|message| message.id == message_id)
            .map(|message| message.sender_id.as_str())
    }

    /// Replace the feed contents with a fresh snapshot.
    ///
    /// Snapshots belonging to another conversation are dropped, guarding
    /// against late emissions from a subscription that was already torn down.
    pub fn replace(&mut self, conversation_id: &str, snapshot: Vec<Message>) -> bool {
        if conversation_id != self.conversation_id {
            return false;
        }

        self.messages = normalize_snapshot(snapshot);
        true
    }
}

/// Dedupe by message id (latest instance wins) and sort into display order.
pub fn normalize_snapshot(snapshot: Vec<Message>) -> Vec<Message> {
    let mut seen_ids = HashSet::new();
    let mut deduped = Vec::with_capacity(snapshot.len());

    for message in snapshot.into_iter().rev() {
        if seen_ids.insert(message.id.clone()) {
            deduped.push(message);
        }
    }

    deduped.sort_by(|a, b| {
        a.sent_at_ms
            .cmp(&b.sent_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    deduped
}
