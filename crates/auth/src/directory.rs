//! Profile/role directory contract and its row types.
//!
//! Each lookup returns zero or one row. "Not found" is `Ok(None)`, never an
//! error; `Err` means the query itself failed (network, timeout, bad payload).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tradepost_core::{BusinessId, MembershipId, UserId};

use crate::Role;

/// Role assignment row (one per user at most).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRow {
    pub user_id: UserId,
    pub role: Role,
}

/// Business profile row (one per user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Only meaningful for ordering businesses.
    #[serde(default)]
    pub is_approved: bool,
}

/// Delegated (staff) membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub membership_id: MembershipId,
    pub user_id: UserId,
    pub parent_business_id: BusinessId,
    pub display_name: String,
    pub is_active: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory query timed out")]
    TimedOut,
}

/// Read-only lookups against the remote data store.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleRow>, QueryError>;

    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<ProfileRow>, QueryError>;

    /// The user's membership row. Implementations should prefer the active
    /// row; callers still check `is_active`.
    async fn fetch_membership(&self, user_id: UserId)
    -> Result<Option<MembershipRow>, QueryError>;

    /// Profile of a business, by business id.
    async fn fetch_business_profile(
        &self,
        business_id: BusinessId,
    ) -> Result<Option<ProfileRow>, QueryError> {
        self.fetch_profile(UserId::from(business_id)).await
    }
}
