//! Backend-as-a-service contracts consumed by the client runtime.
//!
//! Each external collaborator (document store, realtime presence store,
//! identity provider) is a trait here, with an in-memory implementation that
//! preserves the real subscription semantics. The runtime receives these as
//! an explicitly constructed, dependency-injected context rather than
//! process-wide singletons.

/// Identity provider contract and scripted implementation.
pub mod auth;
/// Realtime presence/typing contract and in-memory implementation.
pub mod realtime;
/// Document store contract and in-memory implementation.
pub mod store;

pub use auth::{AuthError, AuthProvider, ScriptedAuthProvider, SignInOutcome};
pub use realtime::{InMemoryPresenceStore, PresenceStore, RealtimeError};
pub use store::{ChatStore, InMemoryChatStore, StoreError};
