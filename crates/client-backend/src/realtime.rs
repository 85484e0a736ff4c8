use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use client_core::types::{PresenceRecord, TypingRecord};

/// Errors surfaced by realtime key-value operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The realtime service is temporarily unreachable.
    #[error("realtime store unavailable: {0}")]
    Unavailable(String),
    /// The realtime service failed internally.
    #[error("realtime store backend failure: {0}")]
    Backend(String),
}

/// Realtime key-value contract for presence and typing paths.
///
/// Each path holds one latest value; watches observe that value and its
/// overwrites. Presence paths support a predeclared on-disconnect write that
/// the service applies when the owning client's connection drops.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Overwrite an identity's presence record.
    async fn set_presence(&self, record: PresenceRecord) -> Result<(), RealtimeError>;

    /// Watch an identity's presence path; `None` until the first write.
    fn watch_presence(&self, identity_id: &str) -> watch::Receiver<Option<PresenceRecord>>;

    /// Overwrite a typing record at its (conversation, sender) path.
    async fn set_typing(&self, record: TypingRecord) -> Result<(), RealtimeError>;

    /// Watch a (conversation, sender) typing path; `None` until first write.
    fn watch_typing(
        &self,
        conversation_id: &str,
        identity_id: &str,
    ) -> watch::Receiver<Option<TypingRecord>>;

    /// Register the presence write applied when this client disconnects.
    async fn register_on_disconnect(
        &self,
        identity_id: &str,
        record: PresenceRecord,
    ) -> Result<(), RealtimeError>;
}

/// In-memory realtime store with watch-channel paths and a disconnect hook
/// simulation for tests.
#[derive(Clone, Default)]
pub struct InMemoryPresenceStore {
    inner: Arc<Mutex<RealtimeInner>>,
}

#[derive(Default)]
struct RealtimeInner {
    presence: HashMap<String, watch::Sender<Option<PresenceRecord>>>,
    typing: HashMap<(String, String), watch::Sender<Option<TypingRecord>>>,
    on_disconnect: HashMap<String, PresenceRecord>,
}

impl RealtimeInner {
    fn presence_path(&mut self, identity_id: &str) -> &watch::Sender<Option<PresenceRecord>> {
        self.presence
            .entry(identity_id.to_owned())
            .or_insert_with(|| watch::channel(None).0)
    }

    fn typing_path(
        &mut self,
        conversation_id: &str,
        identity_id: &str,
    ) -> &watch::Sender<Option<TypingRecord>> {
        self.typing
            .entry((conversation_id.to_owned(), identity_id.to_owned()))
            .or_insert_with(|| watch::channel(None).0)
    }
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RealtimeInner>, RealtimeError> {
        self.inner
            .lock()
            .map_err(|_| RealtimeError::Backend("poisoned lock".to_owned()))
    }

    /// Simulate the service detecting this client's connection drop,
    /// applying any registered on-disconnect write.
    pub fn fire_disconnect(&self, identity_id: &str) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(record) = inner.on_disconnect.remove(identity_id) {
            let _ = inner.presence_path(identity_id).send(Some(record));
        }
    }

    /// Latest presence record at a path, for test assertions.
    pub fn presence_of(&self, identity_id: &str) -> Option<PresenceRecord> {
        let mut inner = self.inner.lock().ok()?;
        inner.presence_path(identity_id).borrow().clone()
    }

    /// Latest typing record at a path, for test assertions.
    pub fn typing_of(&self, conversation_id: &str, identity_id: &str) -> Option<TypingRecord> {
        let mut inner = self.inner.lock().ok()?;
        inner
            .typing_path(conversation_id, identity_id)
            .borrow()
            .clone()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn set_presence(&self, record: PresenceRecord) -> Result<(), RealtimeError> {
        let mut inner = self.lock()?;
        let identity_id = record.identity_id.clone();
        let _ = inner.presence_path(&identity_id).send(Some(record));
        Ok(())
    }

    fn watch_presence(&self, identity_id: &str) -> watch::Receiver<Option<PresenceRecord>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.presence_path(identity_id).subscribe()
    }

    async fn set_typing(&self, record: TypingRecord) -> Result<(), RealtimeError> {
        let mut inner = self.lock()?;
        let path = (record.conversation_id.clone(), record.identity_id.clone());
        let _ = inner.typing_path(&path.0, &path.1).send(Some(record));
        Ok(())
    }

    fn watch_typing(
        &self,
        conversation_id: &str,
        identity_id: &str,
    ) -> watch::Receiver<Option<TypingRecord>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.typing_path(conversation_id, identity_id).subscribe()
    }

    async fn register_on_disconnect(
        &self,
        identity_id: &str,
        record: PresenceRecord,
    ) -> Result<(), RealtimeError> {
        let mut inner = self.lock()?;
        inner.on_disconnect.insert(identity_id.to_owned(), record);
        Ok(())
    }
}
