//! Admin dashboard feeds: accounts and sign-up invitations
//!
//! Both feeds watch whole tables (`profiles`, `invitations`) and trust their
//! payloads. Only admins may load or subscribe; the gate reads the session's
//! `is_admin` flag, so it follows role changes picked up by the session
//! keeper.

use crate::context::Context;
use crate::reconciler::{reload_handler, FeedSpec, FeedSubscription};
use crate::store::{store_handler, EntityStore, Placement};
use lotsync_core::{AppUser, Error, Invitation, Query, Record, RemoteError, Result, Topic};
use std::sync::Arc;

pub const USERS: &str = "users";
pub const PENDING_USERS: &str = "pending";
pub const ACTIVE_USERS: &str = "active";
pub const PENDING_INVITES: &str = "pending";

#[derive(Clone)]
pub struct AdminFeed {
    ctx: Context,
    users: Arc<EntityStore<AppUser>>,
    invitations: Arc<EntityStore<Invitation>>,
}

impl AdminFeed {
    pub fn new(ctx: Context) -> Self {
        let users = EntityStore::builder()
            .collection(USERS, Placement::Front, |_: &AppUser| true)
            .collection(PENDING_USERS, Placement::Front, AppUser::is_pending)
            .collection(ACTIVE_USERS, Placement::Front, AppUser::is_active)
            .build();
        let invitations = EntityStore::builder()
            .collection(PENDING_INVITES, Placement::Front, Invitation::is_pending)
            .build();
        Self {
            ctx,
            users: Arc::new(users),
            invitations: Arc::new(invitations),
        }
    }

    pub fn users_store(&self) -> &Arc<EntityStore<AppUser>> {
        &self.users
    }

    pub fn invitations_store(&self) -> &Arc<EntityStore<Invitation>> {
        &self.invitations
    }

    pub fn users(&self) -> Vec<AppUser> {
        self.users.items(USERS)
    }

    pub fn pending_users(&self) -> Vec<AppUser> {
        self.users.items(PENDING_USERS)
    }

    pub fn active_users(&self) -> Vec<AppUser> {
        self.users.items(ACTIVE_USERS)
    }

    pub fn pending_invites(&self) -> Vec<Invitation> {
        self.invitations.items(PENDING_INVITES)
    }

    fn require_admin(&self) -> Result<()> {
        self.ctx.session.require_user()?;
        if !self.ctx.session.use_session().is_admin {
            return Err(RemoteError::forbidden("admin role required").into());
        }
        Ok(())
    }

    /// Every account, newest first, split into pending and active
    #[tracing::instrument(skip(self))]
    pub async fn load_users(&self) -> Result<Vec<AppUser>> {
        self.require_admin()?;
        let query = Query::table(AppUser::TABLE).order("created_at", false);

        self.users.set_loading(true);
        let result = self.ctx.fetch::<AppUser>("load users", query).await;
        self.users.set_loading(false);
        match result {
            Ok(users) => {
                let pending = users.iter().filter(|u| u.is_pending()).cloned().collect();
                let active = users.iter().filter(|u| u.is_active()).cloned().collect();
                self.users.set(USERS, users.clone());
                self.users.set(PENDING_USERS, pending);
                self.users.set(ACTIVE_USERS, active);
                self.users.set_error(None);
                Ok(users)
            }
            Err(error) => self.failed(&*self.users, error),
        }
    }

    /// Invitations not yet used, newest first
    #[tracing::instrument(skip(self))]
    pub async fn load_invitations(&self) -> Result<Vec<Invitation>> {
        self.require_admin()?;
        let query = Query::table(Invitation::TABLE).order("created_at", false);

        self.invitations.set_loading(true);
        let result = self.ctx.fetch::<Invitation>("load invitations", query).await;
        self.invitations.set_loading(false);
        match result {
            Ok(invitations) => {
                let pending: Vec<Invitation> =
                    invitations.into_iter().filter(Invitation::is_pending).collect();
                self.invitations.set(PENDING_INVITES, pending.clone());
                self.invitations.set_error(None);
                Ok(pending)
            }
            Err(error) => self.failed(&*self.invitations, error),
        }
    }

    fn failed<T: Record, V>(&self, store: &EntityStore<T>, error: Error) -> Result<V> {
        tracing::warn!(table = T::TABLE, error = %error, "admin load failed");
        store.set_error(Some(error.user_message()));
        self.ctx.report(&error);
        Err(error)
    }

    /// Live account and invitation changes; both guards must be kept
    pub async fn subscribe(&self) -> Result<Vec<FeedSubscription>> {
        self.require_admin()?;

        let feed = self.clone();
        let reload_users = reload_handler(move || {
            let feed = feed.clone();
            async move { feed.load_users().await.map(|_| ()) }
        });
        let users = self
            .ctx
            .reconciler
            .subscribe(
                FeedSpec::new(Topic::admin_users(), AppUser::TABLE).trust_payload(true),
                store_handler(self.users.clone()),
                Some(reload_users),
            )
            .await;

        let feed = self.clone();
        let reload_invitations = reload_handler(move || {
            let feed = feed.clone();
            async move { feed.load_invitations().await.map(|_| ()) }
        });
        let invitations = self
            .ctx
            .reconciler
            .subscribe(
                FeedSpec::new(Topic::admin_invitations(), Invitation::TABLE).trust_payload(true),
                store_handler(self.invitations.clone()),
                Some(reload_invitations),
            )
            .await;

        Ok(vec![users, invitations])
    }

    /// Drop everything loaded under the previous account
    pub fn clear(&self) {
        self.users.clear();
        self.invitations.clear();
    }
}
