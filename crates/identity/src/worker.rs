//! Cold start and the session-event loop.

use tokio::task::JoinHandle;

use tradepost_auth::SessionEvent;

use crate::resolver::{IdentityResolver, ResolveOutcome};

/// How [`IdentityResolver::initialize`] settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStart {
    /// No stored session; the context is signed out.
    NoSession,
    /// A stored session was found and resolved.
    Restored(ResolveOutcome),
    /// The session read failed outright.
    SessionReadFailed,
    /// The session read timed out; a background fetch was started.
    SessionReadTimedOut,
    /// The loading ceiling fired first; the primary path keeps running.
    CeilingReached,
}

impl IdentityResolver {
    /// Establish the identity for a fresh process.
    ///
    /// Never reports `loading` for longer than the configured ceiling.
    pub async fn initialize(&self) -> ColdStart {
        let resolver = self.clone();
        let mut primary = tokio::spawn(async move { resolver.cold_start().await });
        self.track(primary.abort_handle());

        let ceiling = self.inner.config.loading_ceiling();
        tokio::select! {
            joined = &mut primary => match joined {
                Ok(ColdStart::SessionReadTimedOut) => {
                    self.inner.context.finish_loading();
                    self.spawn_session_fetch();
                    ColdStart::SessionReadTimedOut
                }
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!("cold start did not complete: {err}");
                    self.inner.context.finish_loading();
                    ColdStart::SessionReadFailed
                }
            },
            _ = tokio::time::sleep(ceiling) => {
                tracing::warn!(?ceiling, "identity still loading; releasing the loading state");
                self.inner.context.finish_loading();
                self.spawn_session_fetch();
                ColdStart::CeilingReached
            }
        }
    }

    async fn cold_start(&self) -> ColdStart {
        let limit = self.inner.config.session_read_timeout();
        let session = match tokio::time::timeout(limit, self.inner.sessions.current_session()).await
        {
            Ok(Ok(Some(session))) => session,
            Ok(Ok(None)) => {
                tracing::debug!("no stored session");
                self.inner.context.finish_loading();
                return ColdStart::NoSession;
            }
            Ok(Err(err)) => {
                tracing::warn!("reading stored session failed: {err}");
                self.inner.context.finish_loading();
                return ColdStart::SessionReadFailed;
            }
            Err(_) => {
                tracing::warn!(?limit, "reading stored session timed out");
                return ColdStart::SessionReadTimedOut;
            }
        };

        tracing::info!(user_id = %session.user_id(), "restoring stored session");
        ColdStart::Restored(self.adopt_session(&session).await)
    }

    /// Best-effort session read after cold start gave up waiting.
    fn spawn_session_fetch(&self) {
        let resolver = self.clone();
        let task = tokio::spawn(async move {
            match resolver.inner.sessions.current_session().await {
                Ok(Some(session)) => {
                    let outcome = resolver.adopt_session(&session).await;
                    tracing::debug!(?outcome, "background session fetch resolved");
                }
                Ok(None) => tracing::debug!("background session fetch found no session"),
                Err(err) => tracing::warn!("background session fetch failed: {err}"),
            }
        });
        self.track(task.abort_handle());
    }

    /// Follow the store's session events until [`IdentityResolver::shutdown`]
    /// or the store goes away.
    pub fn start(&self) -> JoinHandle<()> {
        // Subscribe before spawning so nothing sent after `start` is missed.
        let mut subscription = self.inner.sessions.subscribe();
        let resolver = self.clone();

        tokio::spawn(async move {
            tracing::info!("identity session worker started");
            loop {
                tokio::select! {
                    _ = resolver.inner.shutdown.notified() => {
                        tracing::info!("identity session worker received shutdown");
                        break;
                    }
                    event = subscription.recv() => match event {
                        Some(event) => resolver.handle_session_event(event),
                        None => {
                            tracing::info!("session event stream closed");
                            break;
                        }
                    },
                }
            }
            subscription.unsubscribe();
            tracing::info!("identity session worker stopped");
        })
    }

    /// Stop the event loop and cancel background work.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_one();
        self.inner.lock_state().abort_tasks();
    }

    /// Resolution runs as its own task so a slow directory never holds up
    /// the next event.
    pub(crate) fn handle_session_event(&self, event: SessionEvent) {
        let flow = self.inner.lock_state().auth_flow;
        if let Some(flow) = flow {
            tracing::debug!(event = event.kind(), ?flow, "auth flow in progress; ignoring session event");
            return;
        }

        let Some(session) = event.session() else {
            tracing::info!("session ended elsewhere; clearing identity");
            self.clear_local_identity();
            return;
        };

        let user_id = session.user_id();
        self.adopt_principal(session.principal.clone());
        if self.last_resolved() == Some(user_id) {
            tracing::debug!(%user_id, event = event.kind(), "identity already current");
            return;
        }

        tracing::debug!(%user_id, event = event.kind(), "session changed; resolving");
        let resolver = self.clone();
        let task = tokio::spawn(async move {
            let outcome = resolver.resolve(user_id, true).await;
            tracing::debug!(%user_id, ?outcome, "session change resolved");
        });
        self.track(task.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tradepost_auth::{InMemoryDirectory, InMemorySessionStore, Role, RoleRow};

    use super::*;
    use crate::resolver::AuthFlow;
    use crate::{IdentityConfig, MemoryStorage};

    fn resolver() -> (IdentityResolver, Arc<InMemorySessionStore>, Arc<InMemoryDirectory>) {
        let sessions = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let resolver = IdentityResolver::new(
            sessions.clone(),
            directory.clone(),
            Arc::new(MemoryStorage::new()),
            IdentityConfig::default(),
        );
        (resolver, sessions, directory)
    }

    #[tokio::test(start_paused = true)]
    async fn events_during_auth_flow_are_ignored() {
        let (resolver, sessions, directory) = resolver();
        let user_id = sessions.register("ops@admin.test", "pw");
        directory.put_role(RoleRow {
            user_id,
            role: Role::Admin,
        });
        let session = sessions.restore_session("ops@admin.test").unwrap();

        resolver.inner.lock_state().auth_flow = Some(AuthFlow::SigningIn);
        resolver.handle_session_event(SessionEvent::SignedIn(session.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(directory.role_calls(), 0);
        assert!(!resolver.snapshot().is_authenticated());

        resolver.inner.lock_state().auth_flow = None;
        resolver.handle_session_event(SessionEvent::SignedIn(session));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(directory.role_calls(), 1);
        assert_eq!(resolver.snapshot().role, Some(Role::Admin));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_resolution_does_not_delay_sign_out_event() {
        let (resolver, sessions, directory) = resolver();
        let user_id = sessions.register("ops@admin.test", "pw");
        directory.put_role(RoleRow {
            user_id,
            role: Role::Admin,
        });
        let session = sessions.restore_session("ops@admin.test").unwrap();
        directory.set_hanging(true);

        resolver.handle_session_event(SessionEvent::SignedIn(session));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(directory.role_calls(), 1);

        resolver.handle_session_event(SessionEvent::SignedOut);
        directory.set_hanging(false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = resolver.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.role, None);
        assert_eq!(resolver.last_resolved(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_stops_on_shutdown() {
        let (resolver, _, _) = resolver();
        let worker = resolver.start();
        resolver.shutdown();
        worker.await.unwrap();
    }
}
