//! Per-user notifications
//!
//! The realtime feed only carries inserts for the signed-in user and its
//! payloads are complete rows, so they are applied without a re-fetch. Read
//! and delete operations are optimistic and reload on failure.

use crate::context::Context;
use crate::reconciler::{reload_handler, FeedSpec, FeedSubscription};
use crate::store::{store_handler, EntityStore, Placement};
use lotsync_core::{
    ChangeFilter, ChangeKind, Error, Filter, Mutation, Notification, Query, Record, Result, Topic,
};
use serde_json::json;
use std::sync::Arc;

const ALL: &str = "all";

#[derive(Clone)]
pub struct NotificationsFeed {
    ctx: Context,
    store: Arc<EntityStore<Notification>>,
}

impl NotificationsFeed {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            store: Arc::new(EntityStore::single(Placement::Front)),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<Notification>> {
        &self.store
    }

    pub fn items(&self) -> Vec<Notification> {
        self.store.items(ALL)
    }

    pub fn unread_count(&self) -> usize {
        self.items().iter().filter(|n| !n.read).count()
    }

    /// Replace the store with the user's notifications, newest first
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Result<Vec<Notification>> {
        let user = self.ctx.session.require_user()?;
        let query = Query::table(Notification::TABLE)
            .eq("user_id", user.id)
            .order("created_at", false);

        self.store.set_loading(true);
        let result = self.ctx.fetch::<Notification>("load notifications", query).await;
        self.store.set_loading(false);
        match result {
            Ok(items) => {
                self.store.set(ALL, items.clone());
                self.store.set_error(None);
                Ok(items)
            }
            Err(error) => {
                tracing::warn!(error = %error, "notification load failed");
                self.store.set_error(Some(error.user_message()));
                self.ctx.report(&error);
                Err(error)
            }
        }
    }

    async fn roll_back(&self, error: &Error) {
        tracing::warn!(error = %error, "notification write failed, reloading");
        self.ctx.record_rollback(Notification::TABLE);
        self.ctx.report(error);
        if let Err(reload_error) = self.load().await {
            tracing::warn!(error = %reload_error, "notification reload failed");
        }
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<()> {
        self.ctx.session.require_user()?;
        let patch = json!({ "read": true });
        self.store.update(id, &patch);
        let result = self
            .ctx
            .mutate(
                "mark notification read",
                Mutation::update(Notification::TABLE, id, patch),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                self.roll_back(&error).await;
                Err(error)
            }
        }
    }

    pub async fn mark_all_as_read(&self) -> Result<()> {
        let user = self.ctx.session.require_user()?;
        let patch = json!({ "read": true });
        for unread in self.items().iter().filter(|n| !n.read) {
            self.store.update(&unread.id, &patch);
        }
        let mutation = Mutation::update_where(
            Notification::TABLE,
            vec![Filter::eq("user_id", user.id), Filter::eq("read", false)],
            patch,
        );
        match self.ctx.mutate("mark all notifications read", mutation).await {
            Ok(_) => Ok(()),
            Err(error) => {
                self.roll_back(&error).await;
                Err(error)
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ctx.session.require_user()?;
        self.store.remove(id);
        let result = self
            .ctx
            .mutate("delete notification", Mutation::delete(Notification::TABLE, id))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                self.roll_back(&error).await;
                Err(error)
            }
        }
    }

    /// Live inserts for the signed-in user
    pub async fn subscribe(&self) -> Result<FeedSubscription> {
        let user = self.ctx.session.require_user()?;
        let spec = FeedSpec::new(Topic::notifications(&user.id), Notification::TABLE)
            .filter(ChangeFilter::eq("user_id", user.id.clone()).only(ChangeKind::Insert))
            .trust_payload(true);
        let feed = self.clone();
        let reload = reload_handler(move || {
            let feed = feed.clone();
            async move { feed.load().await.map(|_| ()) }
        });
        Ok(self
            .ctx
            .reconciler
            .subscribe(spec, store_handler(self.store.clone()), Some(reload))
            .await)
    }
}
