//! Unread-message alerts for chat channels
//!
//! Works like the notifications feed: inserts for the signed-in user arrive
//! as complete rows and are applied directly, deduplicated by id. Writes are
//! optimistic and reload on failure.

use crate::context::Context;
use crate::reconciler::{reload_handler, FeedSpec, FeedSubscription};
use crate::store::{store_handler, EntityStore, Placement};
use lotsync_core::{
    ChangeFilter, ChangeKind, ChatNotification, Filter, Mutation, Query, Record, Result, Topic,
};
use serde_json::json;
use std::sync::Arc;

const ALL: &str = "all";

#[derive(Clone)]
pub struct ChatNotificationsFeed {
    ctx: Context,
    store: Arc<EntityStore<ChatNotification>>,
}

impl ChatNotificationsFeed {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            store: Arc::new(EntityStore::single(Placement::Front)),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<ChatNotification>> {
        &self.store
    }

    pub fn items(&self) -> Vec<ChatNotification> {
        self.store.items(ALL)
    }

    pub fn unread_count(&self) -> usize {
        self.items().iter().filter(|n| !n.read).count()
    }

    /// Unread alerts for one channel
    pub fn unread_in(&self, channel_id: &str) -> usize {
        self.items()
            .iter()
            .filter(|n| !n.read && n.channel_id == channel_id)
            .count()
    }

    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Result<Vec<ChatNotification>> {
        let user = self.ctx.session.require_user()?;
        let query = Query::table(ChatNotification::TABLE)
            .eq("user_id", user.id)
            .order("created_at", false);

        self.store.set_loading(true);
        let result = self
            .ctx
            .fetch::<ChatNotification>("load chat notifications", query)
            .await;
        self.store.set_loading(false);
        match result {
            Ok(items) => {
                self.store.set(ALL, items.clone());
                self.store.set_error(None);
                Ok(items)
            }
            Err(error) => {
                tracing::warn!(error = %error, "chat notification load failed");
                self.store.set_error(Some(error.user_message()));
                self.ctx.report(&error);
                Err(error)
            }
        }
    }

    async fn write(&self, label: &str, mutation: Mutation, notify: bool) -> Result<()> {
        match self.ctx.mutate(label, mutation).await {
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::warn!(error = %error, label, "chat notification write failed, reloading");
                self.ctx.record_rollback(ChatNotification::TABLE);
                if notify {
                    self.ctx.report(&error);
                }
                if let Err(reload_error) = self.load().await {
                    tracing::warn!(error = %reload_error, "chat notification reload failed");
                }
                Err(error)
            }
        }
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<()> {
        self.ctx.session.require_user()?;
        let patch = json!({ "read": true });
        self.store.update(id, &patch);
        self.write(
            "mark chat notification read",
            Mutation::update(ChatNotification::TABLE, id, patch),
            true,
        )
        .await
    }

    pub async fn mark_all_as_read(&self) -> Result<()> {
        let user = self.ctx.session.require_user()?;
        let patch = json!({ "read": true });
        for unread in self.items().iter().filter(|n| !n.read) {
            self.store.update(&unread.id, &patch);
        }
        let mutation = Mutation::update_where(
            ChatNotification::TABLE,
            vec![Filter::eq("user_id", user.id), Filter::eq("read", false)],
            patch,
        );
        self.write("mark all chat notifications read", mutation, true)
            .await
    }

    /// Mark every alert for `channel_id` read, e.g. when the channel is opened
    ///
    /// Failures are logged and reloaded but not surfaced as a notice.
    pub async fn clear_channel(&self, channel_id: &str) -> Result<()> {
        let user = self.ctx.session.require_user()?;
        let patch = json!({ "read": true });
        let unread: Vec<String> = self
            .items()
            .into_iter()
            .filter(|n| !n.read && n.channel_id == channel_id)
            .map(|n| n.id)
            .collect();
        for id in &unread {
            self.store.update(id, &patch);
        }
        let mutation = Mutation::update_where(
            ChatNotification::TABLE,
            vec![
                Filter::eq("user_id", user.id),
                Filter::eq("channel_id", channel_id),
                Filter::eq("read", false),
            ],
            patch,
        );
        self.write("clear channel notifications", mutation, false)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ctx.session.require_user()?;
        self.store.remove(id);
        self.write(
            "delete chat notification",
            Mutation::delete(ChatNotification::TABLE, id),
            true,
        )
        .await
    }

    /// Live inserts for the signed-in user
    pub async fn subscribe(&self) -> Result<FeedSubscription> {
        let user = self.ctx.session.require_user()?;
        let spec = FeedSpec::new(Topic::chat_notifications(&user.id), ChatNotification::TABLE)
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
