//! In-memory session store and directory for tests/dev.
//!
//! - No IO
//! - Failure and hang knobs so timeouts and retries can be exercised
//! - Call counters so tests can assert how many queries were issued

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use tradepost_core::UserId;

use crate::directory::{MembershipRow, ProfileDirectory, ProfileRow, QueryError, RoleRow};
use crate::session::{Session, SessionEvent, SessionStore, SessionSubscription, SignUpOptions};
use crate::{AuthError, Principal};

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Park the caller while `hold` is raised; lowering it releases every
/// parked call.
async fn wait_released(hold: &watch::Sender<bool>) {
    let mut released = hold.subscribe();
    // The sender outlives the wait, so this only returns once lowered.
    let _ = released.wait_for(|raised| !*raised).await;
}

/// Consume one unit of an injected failure budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Serialized directory contents (accounts plus rows).
///
/// Used by the `tradepost-identity` binary and by tests that prefer data
/// over builder calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryFixture {
    #[serde(default)]
    pub accounts: Vec<AccountFixture>,
    #[serde(default)]
    pub roles: Vec<RoleRow>,
    #[serde(default)]
    pub profiles: Vec<ProfileRow>,
    #[serde(default)]
    pub memberships: Vec<MembershipRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountFixture {
    pub user_id: UserId,
    pub email: String,
    pub password: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Account {
    user_id: UserId,
    password: String,
}

/// In-memory identity provider.
#[derive(Debug)]
pub struct InMemorySessionStore {
    accounts: Mutex<HashMap<String, Account>>,
    current: Mutex<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
    hang_current: watch::Sender<bool>,
    hang_sign_out: watch::Sender<bool>,
    fail_sign_out: AtomicBool,
    sign_out_calls: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: &DirectoryFixture) -> Self {
        let store = Self::new();
        for account in &fixture.accounts {
            store.register_with_id(account.user_id, &account.email, &account.password);
        }
        store
    }

    /// Register an account with a fresh user id.
    pub fn register(&self, email: &str, password: &str) -> UserId {
        let user_id = UserId::new();
        self.register_with_id(user_id, email, password);
        user_id
    }

    pub fn register_with_id(&self, user_id: UserId, email: &str, password: &str) {
        lock(&self.accounts).insert(
            email.trim().to_ascii_lowercase(),
            Account {
                user_id,
                password: password.to_string(),
            },
        );
    }

    /// Issue a session for a registered account without emitting an event.
    ///
    /// Models a session restored from a previous run.
    pub fn restore_session(&self, email: &str) -> Result<Session, AuthError> {
        let session = self.issue(email)?;
        *lock(&self.current) = Some(session.clone());
        Ok(session)
    }

    /// Rotate the current session's token and announce it.
    pub fn refresh_token(&self) -> Option<Session> {
        let refreshed = {
            let mut current = lock(&self.current);
            let session = current.as_mut()?;
            session.access_token = Uuid::now_v7().to_string();
            session.issued_at = Utc::now();
            session.expires_at = session.issued_at + Duration::hours(1);
            session.clone()
        };
        self.emit(SessionEvent::TokenRefreshed(refreshed.clone()));
        Some(refreshed)
    }

    /// Publish an arbitrary event (e.g. a sign-out from another tab).
    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// While set, session reads wait; clearing it lets them through.
    pub fn set_hang_current(&self, hang: bool) {
        self.hang_current.send_replace(hang);
    }

    pub fn set_hang_sign_out(&self, hang: bool) {
        self.hang_sign_out.send_replace(hang);
    }

    pub fn set_fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    /// Current session without going through the async trait.
    pub fn peek_session(&self) -> Option<Session> {
        lock(&self.current).clone()
    }

    fn issue(&self, email: &str) -> Result<Session, AuthError> {
        let normalized = email.trim().to_ascii_lowercase();
        let account = lock(&self.accounts)
            .get(&normalized)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;
        let issued_at = Utc::now();
        Ok(Session {
            principal: Principal::new(account.user_id, &normalized)?,
            access_token: Uuid::now_v7().to_string(),
            issued_at,
            expires_at: issued_at + Duration::hours(1),
        })
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            events,
            hang_current: watch::channel(false).0,
            hang_sign_out: watch::channel(false).0,
            fail_sign_out: AtomicBool::new(false),
            sign_out_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        wait_released(&self.hang_current).await;
        Ok(lock(&self.current).clone())
    }

    fn subscribe(&self) -> SessionSubscription {
        SessionSubscription::new(self.events.subscribe())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let normalized = email.trim().to_ascii_lowercase();
        let matches = lock(&self.accounts)
            .get(&normalized)
            .is_some_and(|a| a.password == password);
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }

        let session = self.issue(&normalized)?;
        *lock(&self.current) = Some(session.clone());
        self.emit(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<Option<Session>, AuthError> {
        let normalized = email.trim().to_ascii_lowercase();
        if lock(&self.accounts).contains_key(&normalized) {
            return Err(AuthError::AlreadyRegistered);
        }
        // Validate before creating the account.
        Principal::new(UserId::new(), &normalized)?;

        let user_id = self.register(&normalized, password);
        tracing::debug!(%user_id, role = %options.role, business = %options.business_name, "account registered");

        let session = self.issue(&normalized)?;
        *lock(&self.current) = Some(session.clone());
        self.emit(SessionEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        wait_released(&self.hang_sign_out).await;
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(AuthError::Provider("sign-out rejected".to_string()));
        }
        *lock(&self.current) = None;
        self.emit(SessionEvent::SignedOut);
        Ok(())
    }

    fn discard_local_session(&self) {
        *lock(&self.current) = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DirectoryRows {
    roles: HashMap<UserId, RoleRow>,
    profiles: HashMap<UserId, ProfileRow>,
    memberships: HashMap<UserId, Vec<MembershipRow>>,
}

/// In-memory profile/role directory.
#[derive(Debug)]
pub struct InMemoryDirectory {
    rows: Mutex<DirectoryRows>,
    role_failures: AtomicUsize,
    profile_failures: AtomicUsize,
    membership_failures: AtomicUsize,
    hanging: watch::Sender<bool>,
    role_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    membership_calls: AtomicUsize,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self {
            rows: Mutex::default(),
            role_failures: AtomicUsize::new(0),
            profile_failures: AtomicUsize::new(0),
            membership_failures: AtomicUsize::new(0),
            hanging: watch::channel(false).0,
            role_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            membership_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: &DirectoryFixture) -> Self {
        let directory = Self::new();
        for row in &fixture.roles {
            directory.put_role(row.clone());
        }
        for row in &fixture.profiles {
            directory.put_profile(row.clone());
        }
        for row in &fixture.memberships {
            directory.put_membership(row.clone());
        }
        directory
    }

    pub fn put_role(&self, row: RoleRow) {
        lock(&self.rows).roles.insert(row.user_id, row);
    }

    pub fn put_profile(&self, row: ProfileRow) {
        lock(&self.rows).profiles.insert(row.user_id, row);
    }

    pub fn put_membership(&self, row: MembershipRow) {
        lock(&self.rows)
            .memberships
            .entry(row.user_id)
            .or_default()
            .push(row);
    }

    /// Make the next `n` role queries fail.
    pub fn fail_role_queries(&self, n: usize) {
        self.role_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` profile queries fail.
    pub fn fail_profile_queries(&self, n: usize) {
        self.profile_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` membership queries fail.
    pub fn fail_membership_queries(&self, n: usize) {
        self.membership_failures.store(n, Ordering::SeqCst);
    }

    /// While set, every query waits; clearing it lets waiting queries
    /// through.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.send_replace(hanging);
    }

    pub fn role_calls(&self) -> usize {
        self.role_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn membership_calls(&self) -> usize {
        self.membership_calls.load(Ordering::SeqCst)
    }

    async fn maybe_hang(&self) {
        wait_released(&self.hanging).await;
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryDirectory {
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleRow>, QueryError> {
        self.role_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if take_failure(&self.role_failures) {
            return Err(QueryError::Unavailable("role query failed".to_string()));
        }
        Ok(lock(&self.rows).roles.get(&user_id).cloned())
    }

    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<ProfileRow>, QueryError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if take_failure(&self.profile_failures) {
            return Err(QueryError::Unavailable("profile query failed".to_string()));
        }
        Ok(lock(&self.rows).profiles.get(&user_id).cloned())
    }

    async fn fetch_membership(
        &self,
        user_id: UserId,
    ) -> Result<Option<MembershipRow>, QueryError> {
        self.membership_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if take_failure(&self.membership_failures) {
            return Err(QueryError::Unavailable("membership query failed".to_string()));
        }
        let rows = lock(&self.rows);
        let Some(memberships) = rows.memberships.get(&user_id) else {
            return Ok(None);
        };
        Ok(memberships
            .iter()
            .find(|m| m.is_active)
            .or_else(|| memberships.first())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use tradepost_core::{BusinessId, MembershipId};

    #[tokio::test]
    async fn sign_in_checks_password_and_emits_event() {
        let store = InMemorySessionStore::new();
        let user_id = store.register("owner@bistro.example", "hunter2");
        let mut events = store.subscribe();

        let err = store
            .sign_in_with_password("owner@bistro.example", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);

        let session = store
            .sign_in_with_password("Owner@Bistro.example", "hunter2")
            .await
            .unwrap();
        assert_eq!(session.user_id(), user_id);

        let event = events.recv().await.unwrap();
        assert_eq!(event, SessionEvent::SignedIn(session));
    }

    #[tokio::test]
    async fn sign_up_rejects_duplicates() {
        let store = InMemorySessionStore::new();
        store.register("owner@bistro.example", "hunter2");

        let options = SignUpOptions {
            role: Role::BusinessOrdering,
            business_name: "Bistro".to_string(),
            phone: None,
        };
        let err = store
            .sign_up("owner@bistro.example", "pw", options)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::AlreadyRegistered);
    }

    #[tokio::test]
    async fn failure_budget_is_consumed_once_per_query() {
        let directory = InMemoryDirectory::new();
        let user_id = UserId::new();
        directory.put_role(RoleRow {
            user_id,
            role: Role::Admin,
        });
        directory.fail_role_queries(1);

        assert!(directory.fetch_role(user_id).await.is_err());
        assert!(directory.fetch_role(user_id).await.unwrap().is_some());
        assert_eq!(directory.role_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_query_resumes_when_released() {
        let directory = std::sync::Arc::new(InMemoryDirectory::new());
        let user_id = UserId::new();
        directory.put_role(RoleRow {
            user_id,
            role: Role::Admin,
        });
        directory.set_hanging(true);

        let pending = tokio::spawn({
            let directory = directory.clone();
            async move { directory.fetch_role(user_id).await }
        });
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(!pending.is_finished());

        directory.set_hanging(false);
        let row = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(row.role, Role::Admin);
    }

    #[tokio::test]
    async fn membership_lookup_prefers_active_row() {
        let directory = InMemoryDirectory::new();
        let user_id = UserId::new();
        let parent = BusinessId::new();
        for (name, is_active) in [("old", false), ("current", true)] {
            directory.put_membership(MembershipRow {
                membership_id: MembershipId::new(),
                user_id,
                parent_business_id: parent,
                display_name: name.to_string(),
                is_active,
            });
        }

        let row = directory.fetch_membership(user_id).await.unwrap().unwrap();
        assert_eq!(row.display_name, "current");
    }

    #[test]
    fn fixture_deserializes_with_legacy_role_names() {
        let user_id = UserId::new();
        let json = serde_json::json!({
            "accounts": [{ "user_id": user_id, "email": "chef@bistro.example", "password": "pw" }],
            "roles": [{ "user_id": user_id, "role": "restaurant" }],
        });

        let fixture: DirectoryFixture = serde_json::from_value(json).unwrap();
        assert_eq!(fixture.roles[0].role, Role::BusinessOrdering);
        assert!(fixture.profiles.is_empty());
    }
}
