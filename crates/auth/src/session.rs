//! Session store contract (the identity provider, seen from this layer).
//!
//! The store owns the session exclusively. The identity layer only observes
//! it: it reads the current session, listens for changes and forwards the
//! explicit sign-in / sign-up / sign-out calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tradepost_core::UserId;

use crate::{AuthError, Principal, Role};

/// An authenticated session as issued by the identity provider.
///
/// Expiry and refresh are the provider's business; the timestamps are carried
/// for display and diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub principal: Principal,
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }
}

/// Change notifications emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    UserUpdated(Session),
    SignedOut,
}

impl SessionEvent {
    /// The session carried by the event, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionEvent::SignedIn(s)
            | SessionEvent::TokenRefreshed(s)
            | SessionEvent::UserUpdated(s) => Some(s),
            SessionEvent::SignedOut => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SignedIn(_) => "signed_in",
            SessionEvent::TokenRefreshed(_) => "token_refreshed",
            SessionEvent::UserUpdated(_) => "user_updated",
            SessionEvent::SignedOut => "signed_out",
        }
    }
}

/// A subscription to session changes.
///
/// Each subscription receives every event published after it was created.
/// Dropping it (or calling [`SessionSubscription::unsubscribe`]) detaches it
/// from the store.
#[derive(Debug)]
pub struct SessionSubscription {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionSubscription {
    pub fn new(receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the store is gone. Events missed because the
    /// subscriber lagged are skipped with a warning.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "session subscription lagged; events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicitly detach from the store.
    pub fn unsubscribe(self) {
        drop(self.receiver);
    }
}

/// Registration metadata forwarded to the provider on sign-up.
///
/// Creating the role and profile rows from it is the registration flow's job,
/// not this layer's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpOptions {
    pub role: Role,
    pub business_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// The identity provider's session API.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current session, if any. May hang; callers bound it.
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribe to session changes (sign-in, token refresh, sign-out).
    fn subscribe(&self) -> SessionSubscription;

    async fn sign_in_with_password(&self, email: &str, password: &str)
    -> Result<Session, AuthError>;

    /// Register a new account.
    ///
    /// Returns `None` when the provider requires confirmation before a session
    /// is issued.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<Option<Session>, AuthError>;

    /// Revoke the session remotely.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Drop any locally persisted credential, without contacting the provider.
    fn discard_local_session(&self);
}
