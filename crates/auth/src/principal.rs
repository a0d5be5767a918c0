use serde::{Deserialize, Serialize};

use tradepost_core::{DomainError, DomainResult, UserId};

/// Identity of an authenticated principal.
///
/// This is all the session tells us; role, approval and profile come from
/// the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub email: String,
}

impl Principal {
    /// Build a principal, normalizing the email (trimmed, lowercase).
    pub fn new(user_id: UserId, email: impl AsRef<str>) -> DomainResult<Self> {
        let email = email.as_ref().trim().to_ascii_lowercase();
        let Some((local, domain)) = email.split_once('@') else {
            return Err(DomainError::validation(format!("invalid email: {email}")));
        };
        if local.is_empty() || domain.is_empty() {
            return Err(DomainError::validation(format!("invalid email: {email}")));
        }
        Ok(Self { user_id, email })
    }
}

impl core::fmt::Display for Principal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} <{}>", self.user_id, self.email)
    }
}
