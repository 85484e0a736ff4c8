use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use client_core::types::Identity;

/// Errors surfaced by the identity provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The user dismissed the interactive sign-in flow.
    #[error("sign-in flow was cancelled")]
    Cancelled,
    /// The provider failed (network, configuration, service outage).
    #[error("identity provider error: {0}")]
    Provider(String),
}

/// Identity provider contract: interactive sign-in, sign-out, and a
/// push-based view of the current identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Run the interactive sign-in flow.
    ///
    /// Not retried automatically; cancellation and provider failures are
    /// surfaced to the caller.
    async fn sign_in(&self) -> Result<Identity, AuthError>;

    /// Invalidate the current session.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Watch the current identity; `None` whenever signed out.
    fn watch_identity(&self) -> watch::Receiver<Option<Identity>>;
}

/// One scripted outcome for `ScriptedAuthProvider::sign_in`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// Sign-in succeeds with this identity.
    Success(Identity),
    /// The user dismisses the flow.
    Cancelled,
    /// The provider fails with this message.
    ProviderError(String),
}

/// Scripted identity provider used by tests and the shell's local mode.
///
/// Queued outcomes are consumed first; once the queue is empty, sign-in
/// falls back to the fixed identity when one is configured.
#[derive(Clone)]
pub struct ScriptedAuthProvider {
    fixed: Option<Identity>,
    queue: Arc<Mutex<VecDeque<SignInOutcome>>>,
    identity_tx: Arc<watch::Sender<Option<Identity>>>,
}

impl ScriptedAuthProvider {
    /// Provider that always signs in as the given identity.
    pub fn always(identity: Identity) -> Self {
        Self {
            fixed: Some(identity),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            identity_tx: Arc::new(watch::channel(None).0),
        }
    }

    /// Provider that replays the given outcomes in order.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = SignInOutcome>) -> Self {
        Self {
            fixed: None,
            queue: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            identity_tx: Arc::new(watch::channel(None).0),
        }
    }

    /// Append one scripted outcome.
    pub fn push_outcome(&self, outcome: SignInOutcome) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(outcome);
        }
    }
}

#[async_trait]
impl AuthProvider for ScriptedAuthProvider {
    async fn sign_in(&self) -> Result<Identity, AuthError> {
        let scripted = self
            .queue
            .lock()
            .map_err(|_| AuthError::Provider("poisoned lock".to_owned()))?
            .pop_front();

        let outcome = match scripted {
            Some(outcome) => outcome,
            None => match &self.fixed {
                Some(identity) => SignInOutcome::Success(identity.clone()),
                None => {
                    return Err(AuthError::Provider(
                        "no scripted sign-in outcome left".to_owned(),
                    ));
                }
            },
        };

        match outcome {
            SignInOutcome::Success(identity) => {
                let _ = self.identity_tx.send(Some(identity.clone()));
                Ok(identity)
            }
            SignInOutcome::Cancelled => Err(AuthError::Cancelled),
            SignInOutcome::ProviderError(message) => Err(AuthError::Provider(message)),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let _ = self.identity_tx.send(None);
        Ok(())
    }

    fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            id: id.to_owned(),
            display_name: name.to_owned(),
            email: format!("{name}@example.org"),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn fixed_identity_signs_in_repeatedly() {
        let provider = ScriptedAuthProvider::always(identity("u-alice", "Alice"));

        let first = provider.sign_in().await.expect("first sign-in");
        provider.sign_out().await.expect("sign-out");
        let second = provider.sign_in().await.expect("second sign-in");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let provider = ScriptedAuthProvider::with_outcomes([
            SignInOutcome::Cancelled,
            SignInOutcome::ProviderError("popup blocked".to_owned()),
            SignInOutcome::Success(identity("u-alice", "Alice")),
        ]);

        assert_eq!(
            provider.sign_in().await.expect_err("first is cancelled"),
            AuthError::Cancelled
        );
        assert!(matches!(
            provider.sign_in().await.expect_err("second fails"),
            AuthError::Provider(_)
        ));
        provider.sign_in().await.expect("third succeeds");
    }

    #[tokio::test]
    async fn identity_watch_tracks_sign_in_and_out() {
        let provider = ScriptedAuthProvider::always(identity("u-alice", "Alice"));
        let watcher = provider.watch_identity();
        assert_eq!(*watcher.borrow(), None);

        provider.sign_in().await.expect("sign-in");
        assert_eq!(
            watcher.borrow().as_ref().map(|identity| identity.id.clone()),
            Some("u-alice".to_owned())
        );

        provider.sign_out().await.expect("sign-out");
        assert_eq!(*watcher.borrow(), None);
    }
}
