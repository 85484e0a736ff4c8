use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionLifecycleState;

/// Broad error category used for surfacing and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientErrorCategory {
    /// Identity provider failure during an interactive flow.
    Auth,
    /// The user aborted an interactive flow.
    Cancelled,
    /// A write was rejected by the backend (permission/validation).
    Permission,
    /// Invalid input or unsupported state, caught client-side.
    Validation,
    /// Transient network or transport failure.
    Network,
    /// A live subscription dropped.
    Subscription,
    /// Local persistence failure.
    Storage,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ClientErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ClientError {
    /// Construct a new client error.
    pub fn new(
        category: ClientErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SessionLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ClientErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    /// The user dismissed the interactive sign-in flow.
    pub fn auth_cancelled() -> Self {
        Self::new(
            ClientErrorCategory::Cancelled,
            "auth_cancelled",
            "sign-in flow was cancelled by the user",
        )
    }

    /// The identity provider failed during sign-in.
    pub fn auth_provider(message: impl Into<String>) -> Self {
        Self::new(
            ClientErrorCategory::Auth,
            "auth_provider_error",
            message.into(),
        )
    }

    /// A create/update/delete was rejected by the backend.
    pub fn write_rejected(message: impl Into<String>) -> Self {
        Self::new(
            ClientErrorCategory::Permission,
            "write_rejected",
            message.into(),
        )
    }

    /// A client-side validation guard fired.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ClientErrorCategory::Validation, code, message)
    }

    /// A live feed dropped and could not be resumed yet.
    pub fn subscription_lost(message: impl Into<String>) -> Self {
        Self::new(
            ClientErrorCategory::Subscription,
            "subscription_lost",
            message.into(),
        )
    }

    /// Whether this error category is worth retrying automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ClientErrorCategory::Network | ClientErrorCategory::Subscription
        )
    }
}
