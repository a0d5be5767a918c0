//! Identity resolution orchestration.
//!
//! One [`IdentityResolver`] owns the cache slot, the published context and
//! the bookkeeping that keeps resolutions from piling up:
//!
//! - skip guard: a user already resolved is not re-queried unless forced
//! - in-flight guard: never two resolutions for the same user in one epoch
//! - epoch: bumped by sign-out and by a switch to another user; results from
//!   an older epoch are dropped
//! - principal match: nothing is published for a user other than the one
//!   signed in
//! - retry budget: one automatic retry per user after a failure

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;

use tradepost_auth::{
    Principal, ProfileDirectory, ProfileRow, QueryError, RawIdentity, ResolvedIdentity,
    SessionStore, resolve_identity,
};
use tradepost_core::{BusinessId, UserId};

use crate::cache::LocalIdentityCache;
use crate::config::IdentityConfig;
use crate::context::{IdentityContext, IdentitySnapshot};
use crate::storage::KeyValueStorage;

/// Boxed so retry tasks can call back into resolution.
type ResolveFuture<'a> = Pin<Box<dyn Future<Output = ResolveOutcome> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The user is already the last successfully resolved one.
    AlreadyResolved,
    /// A resolution for the user is running.
    InFlight,
    /// Nobody is signed in.
    NotAuthenticated,
}

/// What a call to [`IdentityResolver::resolve`] ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Skipped(SkipReason),
    /// A fresh cache entry was published; no queries were issued.
    CacheHit,
    Resolved(ResolvedIdentity),
    /// Superseded by a sign-out or by another user signing in; nothing was
    /// published.
    Discarded,
    Failed { retry_scheduled: bool },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("role query failed: {0}")]
    RoleQuery(QueryError),

    #[error("profile query failed: {0}")]
    ProfileQuery(QueryError),

    #[error("identity queries timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthFlow {
    SigningIn,
    SigningOut,
}

#[derive(Debug, Default)]
pub(crate) struct ResolverState {
    pub(crate) last_resolved: Option<UserId>,
    /// Running resolutions, keyed to the epoch they started in.
    pub(crate) in_flight: HashMap<UserId, u64>,
    pub(crate) retried: HashSet<UserId>,
    pub(crate) epoch: u64,
    pub(crate) auth_flow: Option<AuthFlow>,
    retries: HashMap<UserId, AbortHandle>,
    tasks: Vec<AbortHandle>,
}

impl ResolverState {
    pub(crate) fn track(&mut self, task: AbortHandle) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    pub(crate) fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.abort_retries();
    }

    fn abort_retries(&mut self) {
        for (_, task) in self.retries.drain() {
            task.abort();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) directory: Arc<dyn ProfileDirectory>,
    pub(crate) cache: LocalIdentityCache,
    pub(crate) context: IdentityContext,
    pub(crate) config: IdentityConfig,
    pub(crate) shutdown: Notify,
    state: Mutex<ResolverState>,
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a user as being resolved for as long as it lives.
struct InFlight<'a> {
    inner: &'a Inner,
    user_id: UserId,
    epoch: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        // A newer epoch may have started its own resolution for this user.
        if state.in_flight.get(&self.user_id) == Some(&self.epoch) {
            state.in_flight.remove(&self.user_id);
        }
    }
}

/// Resolves sessions into published identities.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IdentityResolver {
    pub(crate) inner: Arc<Inner>,
}

impl core::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.lock_state())
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn ProfileDirectory>,
        storage: Arc<dyn KeyValueStorage>,
        config: IdentityConfig,
    ) -> Self {
        let cache = LocalIdentityCache::new(storage, config.cache_ttl());
        Self {
            inner: Arc::new(Inner {
                sessions,
                directory,
                cache,
                context: IdentityContext::new(),
                config,
                shutdown: Notify::new(),
                state: Mutex::new(ResolverState::default()),
            }),
        }
    }

    pub fn context(&self) -> &IdentityContext {
        &self.inner.context
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.inner.context.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.inner.context.subscribe()
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.inner.config
    }

    /// The last user whose resolution completed successfully.
    pub fn last_resolved(&self) -> Option<UserId> {
        self.inner.lock_state().last_resolved
    }

    /// Resolve `user_id` and publish the result.
    ///
    /// Failures never surface here; they are logged, retried once, and the
    /// previously displayed identity stays in place.
    pub async fn resolve(&self, user_id: UserId, force: bool) -> ResolveOutcome {
        self.run(user_id, force).await
    }

    fn run(&self, user_id: UserId, force: bool) -> ResolveFuture<'_> {
        Box::pin(async move {
            let inner = &*self.inner;
            let (epoch, _in_flight, cached) = {
                let mut state = inner.lock_state();
                let epoch = state.epoch;
                if !self.is_current(&state, user_id, epoch) {
                    tracing::debug!(%user_id, "another user is signed in; not resolving");
                    return ResolveOutcome::Discarded;
                }
                if !force && state.last_resolved == Some(user_id) {
                    tracing::debug!(%user_id, "identity already resolved; skipping");
                    return ResolveOutcome::Skipped(SkipReason::AlreadyResolved);
                }
                if state.in_flight.get(&user_id) == Some(&epoch) {
                    tracing::debug!(%user_id, "identity resolution already in flight; skipping");
                    return ResolveOutcome::Skipped(SkipReason::InFlight);
                }
                state.in_flight.insert(user_id, epoch);
                let guard = InFlight {
                    inner,
                    user_id,
                    epoch,
                };

                // Paint before any network call, stale or not.
                let cached = inner.cache.load(user_id);
                if let Some(entry) = &cached {
                    inner.context.publish_cached(entry);
                }
                (epoch, guard, cached)
            };

            if let Some(entry) = cached {
                if !entry.is_stale && !force {
                    tracing::debug!(%user_id, "identity served from fresh cache");
                    return ResolveOutcome::CacheHit;
                }
                tracing::debug!(%user_id, stale = entry.is_stale, "cached identity painted; refreshing");
            }

            if !self.await_attached(user_id, epoch).await {
                tracing::debug!(%user_id, "superseded while waiting for the session; not querying");
                return ResolveOutcome::Discarded;
            }

            match self.fetch_identity(user_id).await {
                Ok(identity) => self.commit(user_id, epoch, identity),
                Err(err) => self.fail(user_id, epoch, err),
            }
        })
    }

    /// Wait (bounded) until the store reports a session for `user_id`.
    ///
    /// Queries sent before the refreshed credential is attached come back
    /// empty or unauthorized, so give it a moment first. Returns `false`
    /// once the resolution has been superseded.
    async fn await_attached(&self, user_id: UserId, epoch: u64) -> bool {
        let inner = &*self.inner;
        let attached = async {
            loop {
                match inner.sessions.current_session().await {
                    Ok(Some(session)) if session.user_id() == user_id => return,
                    Ok(_) => {}
                    Err(err) => tracing::debug!(%user_id, "session check failed: {err}"),
                }
                if !self.still_current(user_id, epoch) {
                    return;
                }
                tokio::time::sleep(inner.config.attach_poll()).await;
            }
        };

        let wait = inner.config.attach_wait();
        if tokio::time::timeout(wait, attached).await.is_err() {
            tracing::warn!(%user_id, ?wait, "session not attached in time; querying anyway");
        }
        self.still_current(user_id, epoch)
    }

    /// A result for `user_id` started in `epoch` may still be published.
    ///
    /// With no principal yet (a bare `resolve` before any sign-in) only the
    /// epoch counts.
    fn is_current(&self, state: &ResolverState, user_id: UserId, epoch: u64) -> bool {
        state.epoch == epoch
            && self
                .inner
                .context
                .principal_id()
                .is_none_or(|current| current == user_id)
    }

    fn still_current(&self, user_id: UserId, epoch: u64) -> bool {
        let state = self.inner.lock_state();
        self.is_current(&state, user_id, epoch)
    }

    async fn fetch_identity(&self, user_id: UserId) -> Result<ResolvedIdentity, ResolveError> {
        let directory = &self.inner.directory;
        let limit = self.inner.config.fetch_timeout();

        let queries = async {
            tokio::join!(
                directory.fetch_role(user_id),
                directory.fetch_profile(user_id),
                directory.fetch_membership(user_id)
            )
        };
        let (role, profile, membership) = tokio::time::timeout(limit, queries)
            .await
            .map_err(|_| ResolveError::TimedOut(limit))?;

        let role = role.map_err(ResolveError::RoleQuery)?;
        let profile = profile.map_err(ResolveError::ProfileQuery)?;
        let membership = membership.unwrap_or_else(|err| {
            tracing::warn!(%user_id, "delegation lookup failed; treating as none: {err}");
            None
        });

        let mut raw = RawIdentity {
            role,
            profile,
            membership,
            parent_profile: None,
        };
        if let Some(parent) = raw.active_membership().map(|m| m.parent_business_id) {
            raw.parent_profile = self.fetch_parent_profile(parent).await;
        }

        Ok(resolve_identity(&raw))
    }

    /// Parent business profile for a delegate. Any failure means "no fields".
    async fn fetch_parent_profile(&self, business_id: BusinessId) -> Option<ProfileRow> {
        let limit = self.inner.config.fetch_timeout();
        let lookup = self.inner.directory.fetch_business_profile(business_id);
        tokio::time::timeout(limit, lookup)
            .await
            .unwrap_or(Err(QueryError::TimedOut))
            .unwrap_or_else(|err| {
                tracing::warn!(%business_id, ?limit, "parent business lookup failed: {err}");
                None
            })
    }

    fn commit(&self, user_id: UserId, epoch: u64, identity: ResolvedIdentity) -> ResolveOutcome {
        let inner = &*self.inner;
        // Held while publishing so a concurrent sign-out cannot interleave.
        let mut state = inner.lock_state();
        if !self.is_current(&state, user_id, epoch) {
            tracing::debug!(%user_id, "superseded during resolution; discarding result");
            return ResolveOutcome::Discarded;
        }

        state.last_resolved = Some(user_id);
        state.retried.remove(&user_id);
        inner.context.publish_resolved(&identity);
        inner.cache.save(
            user_id,
            identity.role,
            &identity.display_profile,
            identity.is_approved,
        );

        tracing::info!(
            %user_id,
            role = ?identity.role,
            approved = identity.is_approved,
            delegated = identity.is_delegated,
            "identity resolved"
        );
        ResolveOutcome::Resolved(identity)
    }

    fn fail(&self, user_id: UserId, epoch: u64, err: ResolveError) -> ResolveOutcome {
        let inner = &*self.inner;
        let mut state = inner.lock_state();
        if !self.is_current(&state, user_id, epoch) {
            tracing::debug!(%user_id, "superseded during resolution; ignoring failure: {err}");
            return ResolveOutcome::Discarded;
        }

        state.last_resolved = None;
        inner.context.finish_loading();

        let retry_scheduled = state.retried.insert(user_id);
        if retry_scheduled {
            let delay = inner.config.retry_delay();
            tracing::error!(%user_id, ?delay, "identity resolution failed; retrying once: {err}");
            let task = self.spawn_retry(user_id, delay);
            if let Some(previous) = state.retries.insert(user_id, task) {
                previous.abort();
            }
        } else {
            tracing::error!(%user_id, "identity resolution failed again; keeping displayed identity: {err}");
        }

        ResolveOutcome::Failed { retry_scheduled }
    }

    fn spawn_retry(&self, user_id: UserId, delay: Duration) -> AbortHandle {
        let resolver = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!(%user_id, "retrying identity resolution");
            let outcome = resolver.run(user_id, true).await;
            tracing::debug!(%user_id, ?outcome, "identity retry finished");
        });
        task.abort_handle()
    }

    pub(crate) fn track(&self, task: AbortHandle) {
        self.inner.lock_state().track(task);
    }

    /// Publish `principal`. Switching to another user invalidates whatever
    /// was still running or scheduled for the previous one.
    pub(crate) fn adopt_principal(&self, principal: Principal) {
        let inner = &*self.inner;
        let mut state = inner.lock_state();
        let previous = inner
            .context
            .principal_id()
            .filter(|previous| *previous != principal.user_id);
        if let Some(previous) = previous {
            tracing::debug!(%previous, user_id = %principal.user_id, "principal switched");
            state.epoch += 1;
            state.last_resolved = None;
            state.retried.clear();
            state.abort_retries();
        }
        inner.context.set_principal(principal);
    }
}
