//! Published identity state.
//!
//! Everything outside the resolver reads identity through an
//! [`IdentitySnapshot`]; only the resolver writes it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use tradepost_auth::{DisplayProfile, Principal, ResolvedIdentity, Role};
use tradepost_core::UserId;

use crate::cache::CacheEntry;

/// Read-only view of who is acting and what they may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySnapshot {
    pub principal: Option<Principal>,
    pub role: Option<Role>,
    pub is_approved: bool,
    pub is_delegated: bool,
    pub display_profile: Option<DisplayProfile>,
    pub loading: bool,
}

impl IdentitySnapshot {
    /// Initial state before the cold-start check has run.
    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::signed_out()
        }
    }

    pub fn signed_out() -> Self {
        Self {
            principal: None,
            role: None,
            is_approved: false,
            is_delegated: false,
            display_profile: None,
            loading: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// Approval gate for ordering features.
    pub fn can_order(&self) -> bool {
        self.role == Some(Role::BusinessOrdering) && self.is_approved
    }
}

/// Watch-channel holder of the current [`IdentitySnapshot`].
#[derive(Debug, Clone)]
pub struct IdentityContext {
    sender: Arc<watch::Sender<IdentitySnapshot>>,
}

impl IdentityContext {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(IdentitySnapshot::loading());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.sender.subscribe()
    }

    pub(crate) fn principal_id(&self) -> Option<UserId> {
        self.sender.borrow().principal.as_ref().map(|p| p.user_id)
    }

    /// Record the signed-in principal. A different user drops whatever
    /// identity was displayed and goes back to loading.
    pub(crate) fn set_principal(&self, principal: Principal) {
        self.sender.send_if_modified(|s| {
            if s.principal.as_ref() == Some(&principal) {
                return false;
            }
            let same_user = s.principal.as_ref().map(|p| p.user_id) == Some(principal.user_id);
            if !same_user {
                *s = IdentitySnapshot::loading();
            }
            s.principal = Some(principal);
            true
        });
    }

    /// Optimistic paint from the local cache. Loading ends: something is
    /// displayable even if a refresh follows.
    pub(crate) fn publish_cached(&self, entry: &CacheEntry) {
        self.sender.send_modify(|s| {
            s.role = entry.role;
            s.is_approved = entry.is_approved;
            s.is_delegated = entry.is_delegated();
            s.display_profile = Some(entry.profile.clone());
            s.loading = false;
        });
    }

    pub(crate) fn publish_resolved(&self, identity: &ResolvedIdentity) {
        self.sender.send_modify(|s| {
            s.role = identity.role;
            s.is_approved = identity.is_approved;
            s.is_delegated = identity.is_delegated;
            s.display_profile = Some(identity.display_profile.clone());
            s.loading = false;
        });
    }

    pub(crate) fn finish_loading(&self) {
        self.sender.send_if_modified(|s| std::mem::replace(&mut s.loading, false));
    }

    pub(crate) fn reset(&self) {
        self.sender.send_replace(IdentitySnapshot::signed_out());
    }
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self::new()
    }
}
