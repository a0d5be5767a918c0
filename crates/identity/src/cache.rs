//! Local identity cache (single slot, session scoped).
//!
//! Holds the last resolved role/profile/approval for exactly one user so the
//! UI can paint immediately on the next resolution. Storage failures are
//! never surfaced: a broken backend just means no optimistic paint.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};

use tradepost_auth::{DisplayProfile, Role};
use tradepost_core::UserId;

use crate::storage::KeyValueStorage;

const KEY_USER_ID: &str = "tradepost.identity.user_id";
const KEY_ROLE: &str = "tradepost.identity.role";
const KEY_PROFILE: &str = "tradepost.identity.profile";
const KEY_IS_APPROVED: &str = "tradepost.identity.is_approved";
const KEY_WRITTEN_AT: &str = "tradepost.identity.written_at";

const ALL_KEYS: [&str; 5] = [
    KEY_USER_ID,
    KEY_ROLE,
    KEY_PROFILE,
    KEY_IS_APPROVED,
    KEY_WRITTEN_AT,
];

/// A cached identity, as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub user_id: UserId,
    pub role: Option<Role>,
    pub profile: DisplayProfile,
    pub is_approved: bool,
    pub written_at: DateTime<Utc>,
    /// Older than the TTL: still displayable, but should be refreshed.
    pub is_stale: bool,
}

impl CacheEntry {
    pub fn is_delegated(&self) -> bool {
        self.profile.is_delegated()
    }
}

/// Single-slot identity cache over a [`KeyValueStorage`].
#[derive(Clone)]
pub struct LocalIdentityCache {
    storage: Arc<dyn KeyValueStorage>,
    ttl: Duration,
}

impl core::fmt::Debug for LocalIdentityCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalIdentityCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LocalIdentityCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store the identity for `user_id`, replacing whatever was there.
    pub fn save(&self, user_id: UserId, role: Option<Role>, profile: &DisplayProfile, is_approved: bool) {
        self.save_at(user_id, role, profile, is_approved, Utc::now());
    }

    /// [`LocalIdentityCache::save`] with an explicit write time.
    pub fn save_at(
        &self,
        user_id: UserId,
        role: Option<Role>,
        profile: &DisplayProfile,
        is_approved: bool,
        written_at: DateTime<Utc>,
    ) {
        if let Err(err) = self.try_save(user_id, role, profile, is_approved, written_at) {
            tracing::debug!(%user_id, "identity cache write skipped: {err:#}");
        }
    }

    /// Cached identity for `user_id`, if the slot holds that user.
    pub fn load(&self, user_id: UserId) -> Option<CacheEntry> {
        self.load_at(user_id, Utc::now())
    }

    /// [`LocalIdentityCache::load`] evaluated at `now`.
    pub fn load_at(&self, user_id: UserId, now: DateTime<Utc>) -> Option<CacheEntry> {
        match self.try_load(user_id, now) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(%user_id, "identity cache read skipped: {err:#}");
                None
            }
        }
    }

    /// Remove every identity key. Never fails.
    pub fn clear(&self) {
        for key in ALL_KEYS {
            if let Err(err) = self.storage.remove(key) {
                tracing::debug!(key, "identity cache clear skipped: {err}");
            }
        }
    }

    fn try_save(
        &self,
        user_id: UserId,
        role: Option<Role>,
        profile: &DisplayProfile,
        is_approved: bool,
        written_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let role = serde_json::to_string(&role).context("failed to encode cached role")?;
        let profile = serde_json::to_string(profile).context("failed to encode cached profile")?;

        // The user key goes last so a half-written slot never claims a user.
        self.storage.remove(KEY_USER_ID)?;
        self.storage.set(KEY_ROLE, &role)?;
        self.storage.set(KEY_PROFILE, &profile)?;
        self.storage.set(KEY_IS_APPROVED, if is_approved { "true" } else { "false" })?;
        self.storage.set(KEY_WRITTEN_AT, &written_at.to_rfc3339())?;
        self.storage.set(KEY_USER_ID, &user_id.to_string())?;
        Ok(())
    }

    fn try_load(&self, user_id: UserId, now: DateTime<Utc>) -> anyhow::Result<Option<CacheEntry>> {
        let Some(stored_user) = self.storage.get(KEY_USER_ID)? else {
            return Ok(None);
        };
        let stored_user: UserId = stored_user.parse().context("invalid cached user id")?;
        if stored_user != user_id {
            tracing::debug!(%stored_user, requested = %user_id, "identity cache belongs to another user; clearing");
            self.clear();
            return Ok(None);
        }

        let (Some(role), Some(profile), Some(is_approved), Some(written_at)) = (
            self.storage.get(KEY_ROLE)?,
            self.storage.get(KEY_PROFILE)?,
            self.storage.get(KEY_IS_APPROVED)?,
            self.storage.get(KEY_WRITTEN_AT)?,
        ) else {
            return Ok(None);
        };

        let role: Option<Role> = serde_json::from_str(&role).context("invalid cached role")?;
        let profile: DisplayProfile =
            serde_json::from_str(&profile).context("invalid cached profile")?;
        let is_approved: bool = is_approved.parse().context("invalid cached approval flag")?;
        let written_at = DateTime::parse_from_rfc3339(&written_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("invalid cached written_at timestamp")?;

        Ok(Some(CacheEntry {
            user_id,
            role,
            profile,
            is_approved,
            written_at,
            is_stale: now.signed_duration_since(written_at) > self.ttl,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, UnavailableStorage};

    fn cache() -> (LocalIdentityCache, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (LocalIdentityCache::new(storage.clone(), Duration::minutes(2)), storage)
    }

    fn profile(name: &str) -> DisplayProfile {
        DisplayProfile {
            name: Some(name.to_string()),
            business_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_returns_fresh_entry() {
        let (cache, _) = cache();
        let user_id = UserId::new();
        cache.save(user_id, Some(Role::BusinessOrdering), &profile("Bistro"), true);

        let entry = cache.load(user_id).expect("entry");
        assert_eq!(entry.role, Some(Role::BusinessOrdering));
        assert!(entry.is_approved);
        assert!(!entry.is_stale);
        assert_eq!(entry.profile.name.as_deref(), Some("Bistro"));
    }

    #[test]
    fn entry_goes_stale_after_ttl() {
        let (cache, _) = cache();
        let user_id = UserId::new();
        let written = Utc::now();
        cache.save_at(user_id, Some(Role::Admin), &profile("Ops"), true, written);

        let fresh = cache.load_at(user_id, written + Duration::minutes(2)).unwrap();
        assert!(!fresh.is_stale);
        let stale = cache.load_at(user_id, written + Duration::seconds(121)).unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.role, Some(Role::Admin));
    }

    #[test]
    fn other_user_misses_and_clears_slot() {
        let (cache, storage) = cache();
        let owner = UserId::new();
        cache.save(owner, Some(Role::BusinessSupplying), &profile("Farm"), true);

        assert!(cache.load(UserId::new()).is_none());
        assert!(storage.is_empty());
        assert!(cache.load(owner).is_none());
    }

    #[test]
    fn save_overwrites_previous_user() {
        let (cache, _) = cache();
        let first = UserId::new();
        let second = UserId::new();
        cache.save(first, Some(Role::Admin), &profile("A"), true);
        cache.save(second, None, &DisplayProfile::default(), false);

        let entry = cache.load(second).unwrap();
        assert_eq!(entry.role, None);
        assert!(!entry.is_approved);
    }

    #[test]
    fn delegation_survives_round_trip() {
        let (cache, _) = cache();
        let user_id = UserId::new();
        let delegated = DisplayProfile {
            parent_business_id: Some(tradepost_core::BusinessId::new()),
            ..profile("Sam")
        };
        cache.save(user_id, Some(Role::BusinessOrdering), &delegated, true);
        assert!(cache.load(user_id).unwrap().is_delegated());
    }

    #[test]
    fn clear_removes_all_keys() {
        let (cache, storage) = cache();
        cache.save(UserId::new(), Some(Role::Admin), &profile("Ops"), true);
        assert_eq!(storage.len(), 5);
        cache.clear();
        assert!(storage.is_empty());
    }

    #[test]
    fn corrupt_blob_reads_as_miss() {
        let (cache, storage) = cache();
        let user_id = UserId::new();
        cache.save(user_id, Some(Role::Admin), &profile("Ops"), true);
        storage.set(KEY_PROFILE, "{not json").unwrap();
        assert!(cache.load(user_id).is_none());
    }

    #[test]
    fn unavailable_storage_never_fails() {
        let cache = LocalIdentityCache::new(Arc::new(UnavailableStorage), Duration::minutes(2));
        let user_id = UserId::new();
        cache.save(user_id, Some(Role::Admin), &profile("Ops"), true);
        assert!(cache.load(user_id).is_none());
        cache.clear();
    }
}
