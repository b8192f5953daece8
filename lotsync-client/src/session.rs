//! Authenticated session ownership
//!
//! [`SessionKeeper`] is the only writer of the session snapshot. Everything
//! else reads it through [`SessionKeeper::use_session`] or a watch receiver.
//!
//! # States
//!
//! ```text
//! Anonymous ──initialize──▶ Loading ──▶ Authenticated
//!     ▲                                      │
//!     └──── sign-out / auth failure ─────────┘
//! ```
//!
//! # Update paths
//!
//! - **Auth pushes** ([`SessionKeeper::handle_auth_change`]) come from the
//!   backend's own auth stream and are applied immediately, bypassing the
//!   refetch throttle.
//! - **Refetch** ([`SessionKeeper::refetch`]) re-validates the session on
//!   demand. At most one runs at a time and at most one reaches the backend
//!   per throttle window; other callers get the cached snapshot.
//! - **Refresh** ([`SessionKeeper::refresh_session`]) renews the token as the
//!   first step of connectivity recovery.
//!
//! Every path captures a liveness generation before suspending and drops its
//! result if the generation moved in the meantime, so a slow response can
//! never overwrite a newer auth push.

use crate::config::ResilienceConfig;
use crate::metrics::ClientMetrics;
use crate::notice::{Notice, Notices};
use crate::remote::Remote;
use crate::retry::RetryPolicy;
use lotsync_core::{AuthChange, AuthEvent, Error, Profile, Query, Result, User};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Loading,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user: Option<User>,
    pub profile: Option<Profile>,
    /// When the backend last confirmed the session
    pub last_refresh: Option<Instant>,
}

impl SessionSnapshot {
    fn anonymous() -> Self {
        Self {
            state: SessionState::Anonymous,
            user: None,
            profile: None,
            last_refresh: None,
        }
    }
}

/// Read-only projection handed to the rest of the application
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub is_admin: bool,
}

/// What the inactivity watchdog did on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Refetched,
    IdleNotice,
    Nothing,
}

pub struct SessionKeeper {
    remote: Remote,
    config: ResilienceConfig,
    snapshot: watch::Sender<SessionSnapshot>,
    generation: AtomicU64,
    refetch_gate: tokio::sync::Mutex<()>,
    last_activity: Mutex<Instant>,
    notices: Notices,
    metrics: Option<Arc<ClientMetrics>>,
}

impl SessionKeeper {
    pub fn new(
        remote: Remote,
        config: ResilienceConfig,
        notices: Notices,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::anonymous());
        Self {
            remote,
            config,
            snapshot,
            generation: AtomicU64::new(0),
            refetch_gate: tokio::sync::Mutex::new(()),
            last_activity: Mutex::new(Instant::now()),
            notices,
            metrics,
        }
    }

    pub fn use_session(&self) -> SessionView {
        let snapshot = self.snapshot.borrow();
        SessionView {
            user: snapshot.user.clone(),
            profile: snapshot.profile.clone(),
            loading: snapshot.state == SessionState::Loading,
            is_admin: snapshot.profile.as_ref().is_some_and(Profile::is_admin),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn user_id(&self) -> Option<String> {
        self.snapshot.borrow().user.as_ref().map(|u| u.id.clone())
    }

    /// Current user, or an auth error when signed out
    pub fn require_user(&self) -> Result<User> {
        self.snapshot
            .borrow()
            .user
            .clone()
            .ok_or_else(|| Error::Session("not signed in".to_string()))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply `update` unless a newer write superseded `generation`
    fn apply(&self, generation: u64, update: impl FnOnce(&mut SessionSnapshot)) -> bool {
        if self.generation() != generation {
            tracing::debug!(generation, current = self.generation(), "discarding stale session result");
            return false;
        }
        self.snapshot.send_modify(update);
        true
    }

    /// Drop to anonymous
    pub fn reset(&self) {
        self.bump();
        self.snapshot.send_replace(SessionSnapshot::anonymous());
        tracing::info!("session reset to anonymous");
    }

    fn reset_if_current(&self, generation: u64) {
        if self.apply(generation, |s| *s = SessionSnapshot::anonymous()) {
            self.bump();
            tracing::info!("session reset to anonymous");
        }
    }

    fn record(&self, kind: &str, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.record_session_refresh(kind, outcome);
        }
    }

    async fn fetch_profile(&self, user_id: &str, policy: &RetryPolicy) -> Result<Option<Profile>> {
        let query = Query::table("profiles").eq("id", user_id).limit(1);
        let rows = self
            .remote
            .call("fetch profile", policy, self.config.profile_timeout, move |b| {
                let query = query.clone();
                async move { b.query(&query).await }
            })
            .await?;
        rows.into_iter()
            .next()
            .map(lotsync_core::from_row)
            .transpose()
    }

    /// Initial session load at application start
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> SessionView {
        let generation = self.generation();
        self.snapshot.send_modify(|s| s.state = SessionState::Loading);

        let result = self
            .remote
            .call(
                "get session",
                &self.config.session_retry,
                self.config.session_timeout,
                |b| async move { b.get_session().await },
            )
            .await;

        match result {
            Ok(Some(session)) => {
                let user = session.user;
                let profile = match self.fetch_profile(&user.id, &self.config.profile_retry).await {
                    Ok(profile) => profile,
                    Err(error) => {
                        tracing::warn!(user = %user.id, error = %error, "profile unavailable at start");
                        None
                    }
                };
                tracing::info!(user = %user.id, has_profile = profile.is_some(), "session restored");
                self.apply(generation, |s| {
                    *s = SessionSnapshot {
                        state: SessionState::Authenticated,
                        user: Some(user),
                        profile,
                        last_refresh: Some(Instant::now()),
                    }
                });
                self.record("initialize", "success");
            }
            Ok(None) => {
                tracing::info!("no session at start");
                self.apply(generation, |s| *s = SessionSnapshot::anonymous());
                self.record("initialize", "anonymous");
            }
            Err(error) => {
                tracing::error!(error = %error, "session fetch failed, continuing signed out");
                self.apply(generation, |s| *s = SessionSnapshot::anonymous());
                self.notices.publish(Notice::from_error(&error));
                self.record("initialize", "error");
            }
        }
        self.use_session()
    }

    /// Apply a push from the backend's auth stream
    ///
    /// Returns true when live feeds should be recreated under the new token.
    #[tracing::instrument(skip(self, change), fields(event = ?change.event))]
    pub fn handle_auth_change(self: &Arc<Self>, change: AuthChange) -> bool {
        let generation = self.bump();

        let session = match (change.event, change.session) {
            (AuthEvent::SignedOut, _) | (_, None) => {
                self.snapshot.send_replace(SessionSnapshot::anonymous());
                tracing::info!("signed out");
                return false;
            }
            (_, Some(session)) => session,
        };

        let user = session.user;
        // profile is re-read on every token refresh
        let refreshed = change.event == AuthEvent::TokenRefreshed;
        let mut needs_profile = false;
        self.snapshot.send_modify(|s| {
            let same_user = s.user.as_ref().map(|u| &u.id) == Some(&user.id);
            if !same_user {
                s.profile = None;
            }
            needs_profile = refreshed || s.profile.is_none();
            s.state = SessionState::Authenticated;
            s.user = Some(user.clone());
            s.last_refresh = Some(Instant::now());
        });

        if needs_profile {
            let keeper = Arc::clone(self);
            tokio::spawn(async move {
                match keeper.fetch_profile(&user.id, &keeper.config.profile_retry).await {
                    Ok(profile) => {
                        keeper.apply(generation, |s| s.profile = profile);
                    }
                    Err(error) => {
                        tracing::warn!(user = %user.id, error = %error, "profile fetch after auth change failed")
                    }
                }
            });
        }

        matches!(change.event, AuthEvent::TokenRefreshed | AuthEvent::SignedIn)
    }

    /// Re-validate the session, throttled
    #[tracing::instrument(skip(self))]
    pub async fn refetch(&self) -> Result<SessionView> {
        let _gate = self.refetch_gate.lock().await;

        let last_refresh = self.snapshot.borrow().last_refresh;
        if let Some(last) = last_refresh {
            if last.elapsed() < self.config.refetch_throttle {
                tracing::debug!("refetch throttled, using cached session");
                return Ok(self.use_session());
            }
        }

        let generation = self.generation();
        let session = self
            .remote
            .call(
                "get session",
                &RetryPolicy::once(),
                self.config.auth_timeout,
                |b| async move { b.get_session().await },
            )
            .await;

        match session {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!("no active session on refetch");
                let reset = self.apply(generation, |s| {
                    *s = SessionSnapshot::anonymous();
                    s.last_refresh = Some(Instant::now());
                });
                if reset {
                    self.bump();
                }
                self.record("refetch", "anonymous");
                return Ok(self.use_session());
            }
            Err(error) => {
                tracing::warn!(error = %error, "session check failed");
                if error.is_auth() {
                    self.reset_if_current(generation);
                    self.notices.publish(Notice::from_error(&error));
                }
                self.record("refetch", "error");
                return Err(error);
            }
        }
        self.apply(generation, |s| s.last_refresh = Some(Instant::now()));

        let user = self
            .remote
            .call(
                "get user",
                &self.config.refetch_retry,
                self.config.auth_timeout,
                |b| async move { b.get_user().await },
            )
            .await;
        let user = match user {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.reset_if_current(generation);
                self.record("refetch", "anonymous");
                return Ok(self.use_session());
            }
            Err(error) => {
                tracing::warn!(error = %error, "user lookup failed");
                if error.is_auth() {
                    self.reset_if_current(generation);
                    self.notices.publish(Notice::from_error(&error));
                }
                self.record("refetch", "error");
                return Err(error);
            }
        };
        let profile = match self.fetch_profile(&user.id, &self.config.refetch_retry).await {
            Ok(profile) => profile,
            Err(error) => {
                // identity matters more than profile detail: stay signed in
                tracing::warn!(user = %user.id, error = %error, "profile refetch failed, keeping user");
                let snapshot = self.snapshot.borrow();
                snapshot
                    .profile
                    .clone()
                    .filter(|p| p.id == user.id)
            }
        };

        self.apply(generation, |s| {
            s.state = SessionState::Authenticated;
            s.user = Some(user);
            s.profile = profile;
        });
        self.record("refetch", "success");
        Ok(self.use_session())
    }

    /// Renew the access token; no-op while signed out
    #[tracing::instrument(skip(self))]
    pub async fn refresh_session(&self) -> Result<()> {
        if self.user_id().is_none() {
            tracing::debug!("no session to refresh");
            return Ok(());
        }

        let generation = self.generation();
        let result = self
            .remote
            .call(
                "refresh session",
                &self.config.reconnect_retry,
                self.config.auth_timeout,
                |b| async move { b.refresh_session().await },
            )
            .await;

        match result {
            Ok(session) => {
                self.apply(generation, |s| {
                    if s.user.as_ref().map(|u| &u.id) != Some(&session.user.id) {
                        s.profile = None;
                    }
                    s.state = SessionState::Authenticated;
                    s.user = Some(session.user);
                    s.last_refresh = Some(Instant::now());
                });
                self.record("refresh", "success");
                Ok(())
            }
            Err(error) => {
                if error.is_auth() {
                    tracing::warn!(error = %error, "session can no longer be refreshed");
                    self.reset_if_current(generation);
                    self.notices.publish(Notice::from_error(&error));
                }
                self.record("refresh", "error");
                Err(error)
            }
        }
    }

    /// Note user input for the inactivity watchdog
    pub fn record_activity(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// One firing of the inactivity watchdog
    ///
    /// Recent input means the tab is in active use, so the session is
    /// re-validated quietly. A user idle for the whole period gets an
    /// informational notice instead.
    pub async fn watchdog_tick(&self) -> WatchdogAction {
        if self.user_id().is_none() {
            return WatchdogAction::Nothing;
        }

        let idle = self.idle_for();
        if idle <= self.config.activity_window {
            tracing::debug!(idle_secs = idle.as_secs(), "active user, refetching session");
            if let Err(error) = self.refetch().await {
                tracing::warn!(error = %error, "background refetch failed");
            }
            WatchdogAction::Refetched
        } else if idle >= self.config.inactivity_timeout {
            self.notices.publish(Notice::info(
                "You have been inactive for a while. Consider refreshing the page to maintain your session.",
            ));
            WatchdogAction::IdleNotice
        } else {
            WatchdogAction::Nothing
        }
    }
}
