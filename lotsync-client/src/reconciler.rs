//! Live feed management
//!
//! The reconciler keeps, for every topic the application wants, exactly one
//! open realtime channel, and routes that channel's events to the feed's
//! change handler.
//!
//! # Per-topic state
//!
//! ```text
//! Unsubscribed ──subscribe──▶ Subscribing ──opened──▶ Subscribed
//!      ▲                           │                      │
//!      └────── open failed ────────┘       recreate ──────┤──▶ Subscribing
//!      └────────────── unsubscribe / channel closed ──────┘
//! ```
//!
//! # Event handling
//!
//! Deletes are forwarded as the bare record id. Inserts and updates are
//! forwarded as-is when the feed trusts its payload; otherwise the payload
//! is treated as a change notification and the full record, join data
//! included, is re-fetched by id. Re-fetches run concurrently, so two quick
//! updates to one record are applied in the order their fetches complete.
//!
//! # Recovery
//!
//! Nothing is diffed or resumed. After a disruption each wanted feed is
//! fully reloaded and then attached to a fresh channel. A feed whose channel
//! could not be opened stays `Unsubscribed` until the next recovery cycle.

use crate::config::ResilienceConfig;
use crate::metrics::ClientMetrics;
use crate::registry::{ChannelHandle, ChannelRegistry};
use crate::remote::Remote;
use crate::retry::RetryPolicy;
use lotsync_core::{ChangeEvent, ChangeFilter, ChangeKind, Query, Result, Topic};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A change delivered to a feed's handler
#[derive(Debug, Clone, PartialEq)]
pub enum FeedChange {
    /// Full row to insert or replace
    Upsert(Value),
    /// Id of a removed row
    Delete(String),
}

/// Handler receiving a feed's changes
pub type ChangeFn =
    Arc<dyn Fn(FeedChange) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Full reload of a feed's server state
pub type ReloadFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`ChangeFn`]
pub fn change_handler<F, Fut>(handler: F) -> ChangeFn
where
    F: Fn(FeedChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |change| Box::pin(handler(change)))
}

/// Wrap an async closure as a [`ReloadFn`]
pub fn reload_handler<F, Fut>(reload: F) -> ReloadFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(reload()))
}

/// What to subscribe to and how to treat its payloads
#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub topic: Topic,
    pub table: String,
    pub filter: Option<ChangeFilter>,
    /// Forward insert/update payloads without re-fetching the record
    pub trust_payload: bool,
    /// Query used to re-fetch one record; an `id` filter is appended
    pub record_query: Query,
}

impl FeedSpec {
    pub fn new(topic: impl Into<Topic>, table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            topic: topic.into(),
            record_query: Query::table(table.clone()),
            table,
            filter: None,
            trust_payload: false,
        }
    }

    pub fn filter(mut self, filter: ChangeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn trust_payload(mut self, trust: bool) -> Self {
        self.trust_payload = trust;
        self
    }

    pub fn refetch_with(mut self, query: Query) -> Self {
        self.record_query = query;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

struct Feed {
    spec: FeedSpec,
    on_change: ChangeFn,
    reload: Option<ReloadFn>,
    /// Identifies the subscription guard that owns this feed
    owner: u64,
    state: FeedState,
    /// Bumped on every (re)open; stale pumps and fetches compare against it
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

pub struct SubscriptionReconciler {
    remote: Remote,
    registry: Arc<ChannelRegistry>,
    config: ResilienceConfig,
    feeds: Mutex<HashMap<Topic, Feed>>,
    /// Serializes subscribe/unsubscribe/recreate so each topic sees
    /// teardown strictly before create
    ops: tokio::sync::Mutex<()>,
    counter: AtomicU64,
    metrics: Option<Arc<ClientMetrics>>,
}

impl SubscriptionReconciler {
    pub fn new(
        remote: Remote,
        registry: Arc<ChannelRegistry>,
        config: ResilienceConfig,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            remote,
            registry,
            config,
            feeds: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
            counter: AtomicU64::new(0),
            metrics,
        }
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<Topic, Feed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Want `spec.topic` live, replacing any existing subscription to it
    ///
    /// Never fails: if the channel cannot be opened now the feed is kept as
    /// wanted and retried by the next recovery cycle.
    #[tracing::instrument(skip_all, fields(topic = %spec.topic))]
    pub async fn subscribe(
        self: &Arc<Self>,
        spec: FeedSpec,
        on_change: ChangeFn,
        reload: Option<ReloadFn>,
    ) -> FeedSubscription {
        let _ops = self.ops.lock().await;
        let topic = spec.topic.clone();
        let owner = self.next_id();

        let previous = self.feeds().insert(
            topic.clone(),
            Feed {
                spec,
                on_change,
                reload,
                owner,
                state: FeedState::Unsubscribed,
                generation: 0,
                pump: None,
            },
        );
        if let Some(pump) = previous.and_then(|f| f.pump) {
            pump.abort();
        }

        if let Err(error) = self.open(&topic).await {
            tracing::warn!(error = %error, "subscribe failed, will retry on next recovery");
        }

        FeedSubscription {
            topic,
            owner,
            reconciler: Arc::downgrade(self),
            active: true,
        }
    }

    /// Stop wanting `topic` and tear its channel down
    pub async fn unsubscribe(&self, topic: &Topic) -> bool {
        let _ops = self.ops.lock().await;
        self.drop_feed(topic, None).await
    }

    async fn unsubscribe_owned(&self, topic: &Topic, owner: u64) -> bool {
        let _ops = self.ops.lock().await;
        self.drop_feed(topic, Some(owner)).await
    }

    async fn drop_feed(&self, topic: &Topic, owner: Option<u64>) -> bool {
        let removed = {
            let mut feeds = self.feeds();
            match feeds.get(topic) {
                Some(feed) if owner.map_or(true, |o| o == feed.owner) => feeds.remove(topic),
                _ => None,
            }
        };
        let Some(feed) = removed else {
            return false;
        };
        if let Some(pump) = feed.pump {
            pump.abort();
        }
        self.registry.remove_topic(topic).await;
        tracing::info!(topic = %topic, "unsubscribed");
        true
    }

    /// Open a fresh channel for a wanted topic; caller holds `ops`
    async fn open(self: &Arc<Self>, topic: &Topic) -> Result<()> {
        let prepared = {
            let mut feeds = self.feeds();
            feeds.get_mut(topic).map(|feed| {
                feed.state = FeedState::Subscribing;
                feed.generation = self.next_id();
                if let Some(pump) = feed.pump.take() {
                    pump.abort();
                }
                (feed.spec.clone(), feed.generation)
            })
        };
        let Some((spec, generation)) = prepared else {
            return Ok(());
        };

        self.registry.remove_topic(topic).await;

        let table = spec.table.clone();
        let filter = spec.filter.clone();
        let opened = self
            .remote
            .call(
                "open channel",
                &RetryPolicy::once(),
                self.config.query_timeout,
                move |b| {
                    let table = table.clone();
                    let filter = filter.clone();
                    async move { b.subscribe_changes(&table, filter.as_ref()).await }
                },
            )
            .await;

        let channel = match opened {
            Ok(channel) => channel,
            Err(error) => {
                self.set_state(topic, generation, FeedState::Unsubscribed);
                return Err(error);
            }
        };

        let handle = ChannelHandle::new(channel.id, topic.clone());
        self.registry.register(handle).await;
        let pump = tokio::spawn(Arc::clone(self).pump(topic.clone(), generation, channel.events));

        if let Some(feed) = self.feeds().get_mut(topic) {
            feed.state = FeedState::Subscribed;
            feed.pump = Some(pump);
        }
        if let Some(ref m) = self.metrics {
            m.record_channel_opened(topic.as_str());
        }
        tracing::info!(topic = %topic, channel = %channel.id, "feed subscribed");
        Ok(())
    }

    fn set_state(&self, topic: &Topic, generation: u64, state: FeedState) -> bool {
        match self.feeds().get_mut(topic) {
            Some(feed) if feed.generation == generation => {
                feed.state = state;
                true
            }
            _ => false,
        }
    }

    fn current(&self, topic: &Topic, generation: u64) -> Option<(FeedSpec, ChangeFn)> {
        self.feeds()
            .get(topic)
            .filter(|f| f.generation == generation)
            .map(|f| (f.spec.clone(), f.on_change.clone()))
    }

    async fn pump(
        self: Arc<Self>,
        topic: Topic,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some((spec, on_change)) = self.current(&topic, generation) else {
                return;
            };
            if let Some(ref m) = self.metrics {
                m.record_change(topic.as_str(), &event.kind.to_string());
            }
            self.dispatch(&topic, generation, spec, on_change, event).await;
        }

        if self.set_state(&topic, generation, FeedState::Unsubscribed) {
            tracing::warn!(topic = %topic, "channel closed by backend, awaiting recovery");
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        topic: &Topic,
        generation: u64,
        spec: FeedSpec,
        on_change: ChangeFn,
        event: ChangeEvent,
    ) {
        let Some(id) = event.record_id() else {
            tracing::warn!(topic = %topic, kind = %event.kind, "change event without record id");
            return;
        };

        match event.kind {
            ChangeKind::Delete => on_change(FeedChange::Delete(id)).await,
            ChangeKind::Insert | ChangeKind::Update if spec.trust_payload => {
                if let Some(row) = event.new {
                    on_change(FeedChange::Upsert(row)).await;
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let reconciler = Arc::clone(self);
                let topic = topic.clone();
                tokio::spawn(async move {
                    reconciler
                        .refetch_and_forward(topic, generation, spec, on_change, id)
                        .await
                });
            }
        }
    }

    async fn refetch_and_forward(
        &self,
        topic: Topic,
        generation: u64,
        spec: FeedSpec,
        on_change: ChangeFn,
        id: String,
    ) {
        let query = spec.record_query.clone().eq("id", id.clone()).limit(1);
        let fetched = self
            .remote
            .call(
                "refetch record",
                &self.config.query_retry,
                self.config.query_timeout,
                move |b| {
                    let query = query.clone();
                    async move { b.query(&query).await }
                },
            )
            .await;

        if self.current(&topic, generation).is_none() {
            tracing::debug!(topic = %topic, id, "dropping re-fetch for superseded channel");
            return;
        }
        match fetched {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => on_change(FeedChange::Upsert(row)).await,
                None => tracing::debug!(topic = %topic, id, "changed record no longer visible"),
            },
            Err(error) => {
                tracing::warn!(topic = %topic, id, error = %error, "record re-fetch failed")
            }
        }
    }

    async fn restore(self: &Arc<Self>, topic: &Topic) -> Result<()> {
        let reload = self.feeds().get(topic).and_then(|f| f.reload.clone());
        if let Some(reload) = reload {
            if let Err(error) = reload().await {
                tracing::warn!(topic = %topic, error = %error, "feed reload failed");
            }
        }
        self.open(topic).await
    }

    /// Reload and reattach every wanted feed; returns how many are live
    #[tracing::instrument(skip(self))]
    pub async fn recreate_all(self: &Arc<Self>) -> usize {
        let _ops = self.ops.lock().await;
        let topics = self.wanted_topics();
        let mut live = 0;
        for topic in &topics {
            match self.restore(topic).await {
                Ok(()) => live += 1,
                Err(error) => {
                    tracing::warn!(topic = %topic, error = %error, "feed not restored, will retry")
                }
            }
        }
        tracing::info!(wanted = topics.len(), live, "feeds recreated");
        live
    }

    /// Reattach only feeds whose channel is gone
    pub async fn recreate_missing(self: &Arc<Self>) -> usize {
        let _ops = self.ops.lock().await;
        let missing: Vec<Topic> = {
            let feeds = self.feeds();
            let mut topics: Vec<Topic> = feeds
                .iter()
                .filter(|(_, f)| f.state == FeedState::Unsubscribed)
                .map(|(t, _)| t.clone())
                .collect();
            topics.sort();
            topics
        };
        let mut restored = 0;
        for topic in &missing {
            if self.restore(topic).await.is_ok() {
                restored += 1;
            }
        }
        if !missing.is_empty() {
            tracing::info!(missing = missing.len(), restored, "missing feeds retried");
        }
        restored
    }

    pub fn state(&self, topic: &Topic) -> FeedState {
        self.feeds()
            .get(topic)
            .map_or(FeedState::Unsubscribed, |f| f.state)
    }

    pub fn wanted_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.feeds().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Forget every feed and stop their pumps; channels are left to the registry
    pub fn shutdown(&self) {
        for (_, feed) in self.feeds().drain() {
            if let Some(pump) = feed.pump {
                pump.abort();
            }
        }
    }
}

/// Scoped ownership of a live feed
///
/// Dropping the guard unsubscribes the topic, unless another subscription
/// has replaced it in the meantime.
pub struct FeedSubscription {
    topic: Topic,
    owner: u64,
    reconciler: Weak<SubscriptionReconciler>,
    active: bool,
}

impl FeedSubscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Unsubscribe now and wait for the teardown
    pub async fn unsubscribe(mut self) -> bool {
        self.active = false;
        match self.reconciler.upgrade() {
            Some(reconciler) => reconciler.unsubscribe_owned(&self.topic, self.owner).await,
            None => false,
        }
    }

    /// Keep the feed alive after the guard is gone
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Some(reconciler) = self.reconciler.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(topic = %self.topic, "feed guard dropped outside a runtime");
            return;
        };
        let topic = self.topic.clone();
        let owner = self.owner;
        runtime.spawn(async move {
            reconciler.unsubscribe_owned(&topic, owner).await;
        });
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("topic", &self.topic)
            .field("owner", &self.owner)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_memory::MemoryBackend;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    fn reconciler(backend: &MemoryBackend) -> (Arc<SubscriptionReconciler>, Arc<ChannelRegistry>) {
        let backend_arc: Arc<dyn lotsync_core::Backend> = Arc::new(backend.clone());
        let (_tx, online) = watch::channel(true);
        let remote = Remote::new(backend_arc.clone(), online, None);
        let registry = Arc::new(ChannelRegistry::new(backend_arc, Duration::from_secs(1), None));
        let config = ResilienceConfig::default().with_retry_policy(RetryPolicy::new(
            2,
            Duration::from_millis(5),
            Duration::from_millis(10),
        ));
        (
            Arc::new(SubscriptionReconciler::new(remote, registry.clone(), config, None)),
            registry,
        )
    }

    fn collector() -> (ChangeFn, mpsc::UnboundedReceiver<FeedChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = change_handler(move |change| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(change);
            }
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<FeedChange>) -> FeedChange {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("change delivered")
            .expect("channel open")
    }

    fn listing_spec() -> FeedSpec {
        FeedSpec::new(Topic::listings(), "listings")
            .refetch_with(Query::table("listings").join("dealer", "profiles", "dealer_id"))
    }

    #[tokio::test]
    async fn test_repeated_subscribe_keeps_one_channel() {
        let backend = MemoryBackend::new();
        let (reconciler, registry) = reconciler(&backend);

        let mut guards = Vec::new();
        for _ in 0..3 {
            let (handler, _rx) = collector();
            guards.push(reconciler.subscribe(listing_spec(), handler, None).await);
            assert_eq!(registry.len().await, 1);
            assert_eq!(backend.open_channels(), 1);
        }
        assert_eq!(reconciler.state(&Topic::listings()), FeedState::Subscribed);
    }

    #[tokio::test]
    async fn test_untrusted_insert_is_refetched_with_joins() {
        let backend = MemoryBackend::new();
        backend.insert_row("profiles", json!({"id": "d1", "dealer_name": "Northside Motors"}));
        let (reconciler, _) = reconciler(&backend);
        let (handler, mut rx) = collector();
        let _guard = reconciler.subscribe(listing_spec(), handler, None).await;

        backend.insert_row("listings", json!({"id": "l1", "dealer_id": "d1", "status": "available"}));

        match next(&mut rx).await {
            FeedChange::Upsert(row) => {
                assert_eq!(row["id"], "l1");
                assert_eq!(row["dealer"]["dealer_name"], "Northside Motors");
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trusted_payload_is_forwarded() {
        let backend = MemoryBackend::new();
        let (reconciler, _) = reconciler(&backend);
        let (handler, mut rx) = collector();
        let spec = FeedSpec::new(Topic::notifications("u1"), "notifications")
            .filter(ChangeFilter::eq("user_id", "u1").only(ChangeKind::Insert))
            .trust_payload(true);
        let _guard = reconciler.subscribe(spec, handler, None).await;

        backend.insert_row("notifications", json!({"id": "n2", "user_id": "u2"}));
        backend.insert_row("notifications", json!({"id": "n1", "user_id": "u1"}));

        assert_eq!(
            next(&mut rx).await,
            FeedChange::Upsert(json!({"id": "n1", "user_id": "u1"}))
        );
        assert_eq!(backend.calls_matching("query:notifications"), 0);
    }

    #[tokio::test]
    async fn test_delete_forwards_id() {
        let backend = MemoryBackend::new();
        backend.insert_row("listings", json!({"id": "l1", "dealer_id": "d1"}));
        let (reconciler, _) = reconciler(&backend);
        let (handler, mut rx) = collector();
        let _guard = reconciler.subscribe(listing_spec(), handler, None).await;

        backend.delete_row("listings", "l1");
        assert_eq!(next(&mut rx).await, FeedChange::Delete("l1".into()));
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_retried_later() {
        let backend = MemoryBackend::new();
        let (reconciler, registry) = reconciler(&backend);
        backend.set_network(false);

        let (handler, _rx) = collector();
        let _guard = reconciler.subscribe(listing_spec(), handler, None).await;
        assert_eq!(reconciler.state(&Topic::listings()), FeedState::Unsubscribed);
        assert!(registry.is_empty().await);

        backend.set_network(true);
        assert_eq!(reconciler.recreate_missing().await, 1);
        assert_eq!(reconciler.state(&Topic::listings()), FeedState::Subscribed);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_recreate_reloads_before_reopening() {
        let backend = MemoryBackend::new();
        let (reconciler, registry) = reconciler(&backend);
        let (handler, _rx) = collector();
        let probe = backend.clone();
        let reload = reload_handler(move || {
            let backend = probe.clone();
            async move {
                backend.log_marker("reload");
                Ok(())
            }
        });
        let _guard = reconciler.subscribe(listing_spec(), handler, Some(reload)).await;
        let first = registry.get(&Topic::listings()).await.unwrap();

        registry.cleanup_all().await;
        assert_eq!(reconciler.recreate_all().await, 1);

        let second = registry.get(&Topic::listings()).await.unwrap();
        assert_ne!(first.id(), second.id());
        let log = backend.call_log();
        let reload_at = log.iter().rposition(|c| c == "marker:reload").unwrap();
        let open_at = log.iter().rposition(|c| c == "subscribe:listings").unwrap();
        assert!(reload_at < open_at);
    }

    #[tokio::test]
    async fn test_dropping_guard_unsubscribes() {
        let backend = MemoryBackend::new();
        let (reconciler, registry) = reconciler(&backend);
        let (handler, _rx) = collector();
        let guard = reconciler.subscribe(listing_spec(), handler, None).await;
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(reconciler.wanted_topics().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_guard_does_not_unsubscribe_successor() {
        let backend = MemoryBackend::new();
        let (reconciler, registry) = reconciler(&backend);
        let (first_handler, _rx1) = collector();
        let first = reconciler.subscribe(listing_spec(), first_handler, None).await;
        let (second_handler, _rx2) = collector();
        let second = reconciler.subscribe(listing_spec(), second_handler, None).await;

        assert!(!first.unsubscribe().await);
        assert!(registry.contains(&Topic::listings()).await);
        assert!(second.unsubscribe().await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_backend_closing_channel_marks_unsubscribed() {
        let backend = MemoryBackend::new();
        let (reconciler, _) = reconciler(&backend);
        let (handler, _rx) = collector();
        let _guard = reconciler.subscribe(listing_spec(), handler, None).await;

        backend.set_network(false);
        tokio::time::timeout(Duration::from_secs(1), async {
            while reconciler.state(&Topic::listings()) != FeedState::Unsubscribed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(reconciler.wanted_topics(), vec![Topic::listings()]);
    }
}
