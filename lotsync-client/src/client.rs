//! The application-facing client
//!
//! [`Client`] owns the component graph ([`Context`]) and the entity feeds,
//! and runs the background work that keeps them current.
//!
//! # Lifecycle
//!
//! 1. **Build**: [`crate::ClientBuilder`] wires the components together
//! 2. **Initialize**: load the session once at start
//! 3. **Monitor**: [`Client::start_connectivity_monitoring`] spawns the
//!    periodic probe, the auth-change listener and the inactivity watchdog
//! 4. **Feed platform signals**: [`Client::handle_platform_event`]
//! 5. **Stop**: [`Client::stop_connectivity_monitoring`] aborts the
//!    background tasks and tears every channel down
//!
//! # Cloning
//!
//! `Client` is cheap to clone; clones share every component.

use crate::admin::AdminFeed;
use crate::chat::ChatFeed;
use crate::chat_notifications::ChatNotificationsFeed;
use crate::config::ResilienceConfig;
use crate::connectivity::{ConnectivityMonitor, Recovery};
use crate::context::Context;
use crate::listings::ListingsFeed;
use crate::notice::{Notice, NoticeAction};
use crate::notifications::NotificationsFeed;
use crate::reconciler::{ChangeFn, FeedSpec, FeedSubscription, ReloadFn, SubscriptionReconciler};
use crate::registry::ChannelRegistry;
use crate::session::{SessionKeeper, SessionView};
use lotsync_core::{Error, Result, Topic};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Browser-level signals the host application forwards to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Online,
    Offline,
    /// The page became visible again
    Visible,
    Hidden,
    /// Any user input
    Activity,
    /// The page is going away
    Unload,
}

#[derive(Clone)]
pub struct Client {
    ctx: Context,
    listings: ListingsFeed,
    notifications: NotificationsFeed,
    chat: ChatFeed,
    chat_notifications: ChatNotificationsFeed,
    admin: AdminFeed,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Client {
    pub(crate) fn from_context(ctx: Context) -> Self {
        Self {
            listings: ListingsFeed::new(ctx.clone()),
            notifications: NotificationsFeed::new(ctx.clone()),
            chat: ChatFeed::new(ctx.clone()),
            chat_notifications: ChatNotificationsFeed::new(ctx.clone()),
            admin: AdminFeed::new(ctx.clone()),
            ctx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.ctx.config
    }

    pub fn session(&self) -> &Arc<SessionKeeper> {
        &self.ctx.session
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.ctx.connectivity
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.ctx.registry
    }

    pub fn reconciler(&self) -> &Arc<SubscriptionReconciler> {
        &self.ctx.reconciler
    }

    pub fn listings(&self) -> &ListingsFeed {
        &self.listings
    }

    pub fn notifications(&self) -> &NotificationsFeed {
        &self.notifications
    }

    pub fn chat(&self) -> &ChatFeed {
        &self.chat
    }

    pub fn chat_notifications(&self) -> &ChatNotificationsFeed {
        &self.chat_notifications
    }

    /// Account and invitation feeds; every operation requires the admin role
    pub fn admin(&self) -> &AdminFeed {
        &self.admin
    }

    /// Stream of user-facing notices
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.ctx.notices.subscribe()
    }

    pub fn use_session(&self) -> SessionView {
        self.ctx.session.use_session()
    }

    pub fn is_online(&self) -> bool {
        self.ctx.connectivity.is_online()
    }

    /// Load the session at application start
    pub async fn initialize(&self) -> SessionView {
        self.ctx.session.initialize().await
    }

    /// Keep `spec.topic` live until the returned guard is dropped
    pub async fn subscribe(
        &self,
        spec: FeedSpec,
        on_change: ChangeFn,
        reload: Option<ReloadFn>,
    ) -> FeedSubscription {
        self.ctx.reconciler.subscribe(spec, on_change, reload).await
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> bool {
        self.ctx.reconciler.unsubscribe(topic).await
    }

    /// Run the recovery sequence now
    pub async fn reconnect(&self) -> Result<Recovery> {
        self.ctx.connectivity.reconnect(&self.ctx).await
    }

    /// Recovery triggered by a connectivity signal; outcomes become notices
    async fn recover(&self) {
        match self.reconnect().await {
            Ok(Recovery::Restored) => {
                self.ctx.notices.publish(Notice::success("Connection restored"));
            }
            Ok(Recovery::AlreadyRunning) | Err(Error::Offline) => {}
            Err(error) => {
                tracing::warn!(error = %error, "recovery failed, will retry on next signal");
                let notice = if error.is_auth() {
                    Notice::from_error(&error)
                } else {
                    Notice::error("Connection issues detected. Some features may not work properly.")
                        .with_action(NoticeAction::Refresh)
                };
                self.ctx.notices.publish(notice);
            }
        }
    }

    /// Forward a platform signal
    #[tracing::instrument(skip(self))]
    pub async fn handle_platform_event(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::Online => {
                self.ctx.connectivity.set_online(true);
                self.recover().await;
            }
            PlatformEvent::Offline => {
                self.ctx.connectivity.set_online(false);
            }
            PlatformEvent::Visible => {
                if self.ctx.connectivity.check_connection().await {
                    self.recover().await;
                    if let Err(error) = self.ctx.session.refetch().await {
                        tracing::debug!(error = %error, "session refetch on visibility failed");
                    }
                }
            }
            PlatformEvent::Hidden => {
                tracing::debug!("page hidden");
            }
            PlatformEvent::Activity => self.ctx.session.record_activity(),
            PlatformEvent::Unload => {
                // feeds still wanted here would be reopened by the probe loop
                self.ctx.reconciler.shutdown();
                self.ctx.registry.cleanup_all().await;
            }
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the probe loop, the auth listener and the inactivity watchdog
    pub fn start_connectivity_monitoring(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            tracing::debug!("connectivity monitoring already running");
            return;
        }
        tasks.push(tokio::spawn(self.clone().probe_loop()));
        tasks.push(tokio::spawn(self.clone().auth_loop()));
        tasks.push(tokio::spawn(self.clone().watchdog_loop()));
        tracing::info!(
            probe_interval_secs = self.ctx.config.probe_interval.as_secs(),
            "connectivity monitoring started"
        );
    }

    /// Abort background work and tear every channel down
    pub async fn stop_connectivity_monitoring(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.ctx.reconciler.shutdown();
        let closed = self.ctx.registry.cleanup_all().await;
        tracing::info!(tasks = tasks.len(), closed, "connectivity monitoring stopped");
    }

    async fn probe_loop(self) {
        let period = self.ctx.config.probe_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let was_online = self.ctx.connectivity.is_online();
            let online = self.ctx.connectivity.check_connection().await;
            if online && !was_online {
                self.recover().await;
            } else if online {
                self.ctx.reconciler.recreate_missing().await;
            }
        }
    }

    /// Tear down and clear every feed scoped to `user_id`
    ///
    /// Runs when that user signs out or another account signs in, so no
    /// channel or cached row of the previous account survives the switch.
    pub async fn forget_user(&self, user_id: &str) {
        let mut dropped = 0;
        for topic in Topic::user_scoped(user_id) {
            if self.ctx.reconciler.unsubscribe(&topic).await {
                dropped += 1;
            }
        }
        self.chat.close_channel().await;
        self.chat.channels_store().clear();
        self.notifications.store().clear();
        self.chat_notifications.store().clear();
        self.admin.clear();
        tracing::info!(user = %user_id, dropped, "feeds of previous user dropped");
    }

    async fn auth_loop(self) {
        let mut changes = self.ctx.remote.backend().auth_changes();
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let previous = self.ctx.session.user_id();
                    let recreate = self.ctx.session.handle_auth_change(change);
                    if let Some(previous) = previous {
                        if self.ctx.session.user_id().as_ref() != Some(&previous) {
                            self.forget_user(&previous).await;
                        }
                    }
                    if recreate {
                        self.ctx.reconciler.recreate_all().await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "auth change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("auth change stream closed");
                    return;
                }
            }
        }
    }

    async fn watchdog_loop(self) {
        let period = self.ctx.config.inactivity_timeout;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let action = self.ctx.session.watchdog_tick().await;
            tracing::debug!(?action, "inactivity watchdog fired");
        }
    }
}
