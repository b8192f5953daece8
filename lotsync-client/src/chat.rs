//! Chat channels and the open conversation
//!
//! At most one channel is open at a time. Opening a channel tears down the
//! previous conversation's message feed before anything else happens, then
//! loads the latest page of history and subscribes to new messages. Message
//! inserts are re-fetched so they carry the sender's profile data.
//!
//! History is kept oldest first. The backend pages newest first, so each
//! page is reversed before it is stored.

use crate::context::{decode_rows, Context};
use crate::reconciler::{reload_handler, FeedSpec, FeedSubscription};
use crate::store::{store_handler, EntityStore, Placement};
use chrono::{DateTime, Utc};
use lotsync_core::{
    ChangeFilter, ChangeKind, ChatChannel, ChatMessage, DealerSummary, Error, Mutation, Query,
    Record, RemoteError, Result, Topic,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const ALL: &str = "all";

struct OpenChannel {
    id: String,
    feed: FeedSubscription,
}

#[derive(Clone)]
pub struct ChatFeed {
    ctx: Context,
    channels: Arc<EntityStore<ChatChannel>>,
    messages: Arc<EntityStore<ChatMessage>>,
    open: Arc<Mutex<Option<OpenChannel>>>,
    has_more: Arc<AtomicBool>,
}

impl ChatFeed {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            channels: Arc::new(EntityStore::single(Placement::Front)),
            messages: Arc::new(EntityStore::single(Placement::Back)),
            open: Arc::new(Mutex::new(None)),
            has_more: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channels_store(&self) -> &Arc<EntityStore<ChatChannel>> {
        &self.channels
    }

    pub fn messages_store(&self) -> &Arc<EntityStore<ChatMessage>> {
        &self.messages
    }

    pub fn channels(&self) -> Vec<ChatChannel> {
        self.channels.items(ALL)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.items(ALL)
    }

    pub fn active_channel(&self) -> Option<ChatChannel> {
        self.channels.selected()
    }

    /// Whether older history remains to be paged in
    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self))]
    pub async fn load_channels(&self) -> Result<Vec<ChatChannel>> {
        self.channels.set_loading(true);
        let result = self.ctx.rpc("get_user_channels", json!({})).await;
        self.channels.set_loading(false);
        match result.map(rows) {
            Ok(rows) => {
                let channels: Vec<ChatChannel> = decode_rows(rows);
                self.channels.set(ALL, channels.clone());
                self.channels.set_error(None);
                Ok(channels)
            }
            Err(error) => {
                self.channels.set_error(Some(error.user_message()));
                self.ctx.report(&error);
                Err(error)
            }
        }
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>> {
        let params = json!({
            "p_channel_id": channel_id,
            "p_limit": self.ctx.config.chat_page_size,
            "p_before_timestamp": before.map(|t| t.to_rfc3339()),
        });
        let page = self.ctx.rpc("fetch_channel_messages", params).await?;
        let mut messages: Vec<ChatMessage> = decode_rows(rows(page));
        self.has_more
            .store(messages.len() == self.ctx.config.chat_page_size, Ordering::SeqCst);
        messages.reverse();
        Ok(messages)
    }

    async fn load_history(&self, channel_id: &str) -> Result<()> {
        self.messages.set_loading(true);
        let page = self.fetch_page(channel_id, None).await;
        self.messages.set_loading(false);
        match page {
            Ok(messages) => {
                tracing::debug!(channel = channel_id, count = messages.len(), "history loaded");
                self.messages.set(ALL, messages);
                self.messages.set_error(None);
                Ok(())
            }
            Err(error) => {
                self.messages.set_error(Some(error.user_message()));
                Err(error)
            }
        }
    }

    fn is_open(&self, channel_id: &str) -> bool {
        self.active_channel().is_some_and(|c| c.id == channel_id)
    }

    /// Switch the conversation to `channel_id`
    #[tracing::instrument(skip(self))]
    pub async fn open_channel(&self, channel_id: &str) -> Result<ChatChannel> {
        let mut open = self.open.lock().await;
        if let Some(previous) = open.take() {
            tracing::debug!(channel = %previous.id, "closing previous conversation");
            previous.feed.unsubscribe().await;
        }
        self.messages.clear();
        self.has_more.store(false, Ordering::SeqCst);

        let channel = self
            .ctx
            .fetch_one::<ChatChannel>(
                "fetch channel",
                Query::table(ChatChannel::TABLE).eq("id", channel_id),
            )
            .await?
            .ok_or_else(|| Error::Remote(RemoteError::not_found("Channel not found")))?;
        self.channels.select(Some(channel.clone()));

        if let Err(error) = self.load_history(channel_id).await {
            self.ctx.report(&error);
            return Err(error);
        }
        self.mark_read(channel_id).await;

        let spec = FeedSpec::new(Topic::messages(channel_id), ChatMessage::TABLE)
            .filter(ChangeFilter::eq("channel_id", channel_id).only(ChangeKind::Insert))
            .trust_payload(false)
            .refetch_with(
                Query::table(ChatMessage::TABLE).join("sender", "profiles", "sender_id"),
            );
        let feed = self.clone();
        let reload_id = channel_id.to_string();
        let reload = reload_handler(move || {
            let feed = feed.clone();
            let channel_id = reload_id.clone();
            async move {
                if !feed.is_open(&channel_id) {
                    return Ok(());
                }
                feed.load_history(&channel_id).await
            }
        });
        let subscription = self
            .ctx
            .reconciler
            .subscribe(spec, store_handler(self.messages.clone()), Some(reload))
            .await;

        *open = Some(OpenChannel {
            id: channel_id.to_string(),
            feed: subscription,
        });
        tracing::info!(channel = channel_id, "conversation opened");
        Ok(channel)
    }

    async fn mark_read(&self, channel_id: &str) {
        let result = self
            .ctx
            .rpc("mark_channel_as_read", json!({ "p_channel_id": channel_id }))
            .await;
        match result {
            Ok(_) => {
                self.channels.update(channel_id, &json!({ "unread_count": 0 }));
            }
            Err(error) => {
                tracing::warn!(channel = channel_id, error = %error, "could not mark channel read")
            }
        }
    }

    /// Prepend the page of history older than what is loaded
    pub async fn load_older(&self) -> Result<usize> {
        let Some(channel) = self.active_channel() else {
            return Err(Error::Validation("No active channel".to_string()));
        };
        let loaded = self.messages();
        let Some(oldest) = loaded.first().map(|m| m.created_at) else {
            return Ok(0);
        };
        if !self.has_more() {
            return Ok(0);
        }

        let older = self.fetch_page(&channel.id, Some(oldest)).await?;
        let count = older.len();
        if !self.is_open(&channel.id) {
            return Ok(0);
        }
        let mut merged = older;
        merged.extend(self.messages());
        self.messages.set(ALL, merged);
        Ok(count)
    }

    /// Post to the open channel
    ///
    /// The message shows up at once under a local id and is swapped for
    /// the stored row when the write succeeds.
    #[tracing::instrument(skip(self, content))]
    pub async fn send_message(&self, content: &str) -> Result<ChatMessage> {
        let Some(channel) = self.active_channel() else {
            return Err(Error::Validation("No active channel".to_string()));
        };
        if content.trim().is_empty() {
            return Err(Error::Validation("Message cannot be empty".to_string()));
        }
        let user = self.ctx.session.require_user()?;
        let sender = self.ctx.session.use_session().profile.map(|p| DealerSummary {
            dealer_name: p.dealer_name,
            phone: p.phone,
            address: p.address,
            email: p.email,
        });

        let local_id = format!("local-{:016x}", rand::random::<u64>());
        self.messages.add(ChatMessage {
            id: local_id.clone(),
            channel_id: channel.id.clone(),
            sender_id: user.id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            sender: sender.clone(),
        });

        let row = json!({
            "channel_id": channel.id,
            "sender_id": user.id,
            "content": content,
        });
        let result = self
            .ctx
            .mutate("send message", Mutation::insert(ChatMessage::TABLE, row))
            .await;
        self.messages.remove(&local_id);

        match result.and_then(lotsync_core::from_row::<ChatMessage>) {
            Ok(mut stored) => {
                if stored.sender.is_none() {
                    stored.sender = sender;
                }
                self.messages.add(stored.clone());
                Ok(stored)
            }
            Err(error) => {
                tracing::warn!(error = %error, "send failed, reloading history");
                self.ctx.record_rollback(ChatMessage::TABLE);
                self.ctx.report(&error);
                if self.is_open(&channel.id) {
                    if let Err(reload_error) = self.load_history(&channel.id).await {
                        tracing::warn!(error = %reload_error, "history reload failed");
                    }
                }
                Err(error)
            }
        }
    }

    /// Leave the open conversation
    pub async fn close_channel(&self) {
        let mut open = self.open.lock().await;
        if let Some(previous) = open.take() {
            previous.feed.unsubscribe().await;
            tracing::info!(channel = %previous.id, "conversation closed");
        }
        self.messages.clear();
        self.channels.select(None);
        self.has_more.store(false, Ordering::SeqCst);
    }
}

/// Procedure results are arrays of rows; anything else reads as empty
fn rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => {
            tracing::warn!(kind = ?other, "expected an array of rows");
            Vec::new()
        }
    }
}
