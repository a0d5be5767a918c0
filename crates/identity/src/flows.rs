//! Sign-in, sign-up and sign-out.
//!
//! While one of these runs, session events from the store are ignored; the
//! flow itself publishes the outcome.

use tradepost_auth::{AuthError, Session, SignUpOptions};

use crate::resolver::{AuthFlow, IdentityResolver, ResolveOutcome, SkipReason};

/// Holds the auth-flow flag; clears it on drop unless a newer flow took over.
struct FlowGuard<'a> {
    resolver: &'a IdentityResolver,
    flow: AuthFlow,
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.resolver.inner.lock_state();
        if state.auth_flow == Some(self.flow) {
            state.auth_flow = None;
        }
    }
}

impl IdentityResolver {
    fn begin_flow(&self, flow: AuthFlow) -> FlowGuard<'_> {
        self.inner.lock_state().auth_flow = Some(flow);
        FlowGuard {
            resolver: self,
            flow,
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let _flow = self.begin_flow(AuthFlow::SigningIn);
        let session = self
            .inner
            .sessions
            .sign_in_with_password(email, password)
            .await
            .inspect_err(|err| tracing::warn!("sign-in rejected: {err}"))?;

        tracing::info!(user_id = %session.user_id(), "signed in");
        self.adopt_session(&session).await;
        Ok(session)
    }

    /// Register a new account. `Ok(None)` means the account exists but has
    /// to be confirmed before a session is issued.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<Option<Session>, AuthError> {
        let _flow = self.begin_flow(AuthFlow::SigningIn);
        let session = self
            .inner
            .sessions
            .sign_up(email, password, options)
            .await
            .inspect_err(|err| tracing::warn!("sign-up rejected: {err}"))?;

        match &session {
            Some(session) => {
                tracing::info!(user_id = %session.user_id(), "signed up");
                self.adopt_session(session).await;
            }
            None => tracing::info!("signed up; awaiting confirmation"),
        }
        Ok(session)
    }

    /// End the session. Local state is gone when this returns, whatever the
    /// provider does.
    pub async fn sign_out(&self) {
        let _flow = self.begin_flow(AuthFlow::SigningOut);
        self.clear_local_identity();

        let limit = self.inner.config.sign_out_timeout();
        let remote = tokio::time::timeout(limit, self.inner.sessions.sign_out())
            .await
            .unwrap_or(Err(AuthError::TimedOut));
        match remote {
            Ok(()) => tracing::info!("signed out"),
            Err(err) => tracing::warn!(?limit, "remote sign-out failed; local state cleared: {err}"),
        }

        self.inner.sessions.discard_local_session();
        self.clear_local_identity();
    }

    /// Force a fresh resolution for whoever is signed in.
    pub async fn refresh(&self) -> ResolveOutcome {
        let principal = self.inner.context.snapshot().principal;
        match principal {
            Some(principal) => self.resolve(principal.user_id, true).await,
            None => ResolveOutcome::Skipped(SkipReason::NotAuthenticated),
        }
    }

    pub(crate) async fn adopt_session(&self, session: &Session) -> ResolveOutcome {
        self.adopt_principal(session.principal.clone());
        self.resolve(session.user_id(), true).await
    }

    /// Drop everything this process knows about the current identity.
    ///
    /// Outstanding resolutions are invalidated and pending retries cancelled.
    /// A resolution started afterwards never waits on one from before.
    pub(crate) fn clear_local_identity(&self) {
        let inner = &*self.inner;
        let mut state = inner.lock_state();
        state.epoch += 1;
        state.last_resolved = None;
        state.in_flight.clear();
        state.retried.clear();
        state.abort_tasks();
        inner.cache.clear();
        inner.context.reset();
    }
}
