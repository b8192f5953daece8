//! Ledger of open realtime channels
//!
//! Every channel the client opens is recorded here under its topic. The
//! registry enforces that a topic never has two live handles: registering a
//! second handle for a topic tears the first one down beforehand. Teardown
//! is idempotent, both per handle and for the bulk [`ChannelRegistry::cleanup_all`]
//! used on unload and hard reconnect.
//!
//! All operations are serialized by one async lock, which is held across the
//! remote teardown so that teardown-before-create ordering holds even when
//! several tasks touch the same topic.

use crate::metrics::ClientMetrics;
use lotsync_core::{Backend, ChannelId, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Reference to one open subscription
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    topic: Topic,
    torn_down: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, topic: Topic) -> Self {
        Self {
            id,
            topic,
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

pub struct ChannelRegistry {
    backend: Arc<dyn Backend>,
    channels: Mutex<HashMap<Topic, ChannelHandle>>,
    teardown_timeout: Duration,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ChannelRegistry {
    pub fn new(
        backend: Arc<dyn Backend>,
        teardown_timeout: Duration,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            backend,
            channels: Mutex::new(HashMap::new()),
            teardown_timeout,
            metrics,
        }
    }

    /// Record `handle`, tearing down any handle already held for its topic
    pub async fn register(&self, handle: ChannelHandle) {
        let mut channels = self.channels.lock().await;
        if let Some(previous) = channels.get(handle.topic()).cloned() {
            if previous.id() != handle.id() {
                tracing::debug!(topic = %handle.topic(), old = %previous.id(), "replacing channel");
                self.teardown(&previous).await;
            }
        }
        tracing::debug!(topic = %handle.topic(), channel = %handle.id(), "channel registered");
        channels.insert(handle.topic().clone(), handle);
    }

    /// Tear `handle` down remotely, then forget it if it is still the registered one
    pub async fn remove(&self, handle: &ChannelHandle) {
        let mut channels = self.channels.lock().await;
        self.teardown(handle).await;
        if channels.get(handle.topic()).map(|h| h.id()) == Some(handle.id()) {
            channels.remove(handle.topic());
        }
    }

    /// Tear down and forget whatever is registered for `topic`
    pub async fn remove_topic(&self, topic: &Topic) -> Option<ChannelHandle> {
        let mut channels = self.channels.lock().await;
        let handle = channels.get(topic).cloned()?;
        self.teardown(&handle).await;
        channels.remove(topic);
        Some(handle)
    }

    /// Tear down every registered channel
    pub async fn cleanup_all(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let handles: Vec<ChannelHandle> = channels.values().cloned().collect();
        for handle in &handles {
            self.teardown(handle).await;
        }
        channels.clear();
        if !handles.is_empty() {
            tracing::info!(count = handles.len(), "all channels cleaned up");
        }
        handles.len()
    }

    pub async fn get(&self, topic: &Topic) -> Option<ChannelHandle> {
        self.channels.lock().await.get(topic).cloned()
    }

    pub async fn contains(&self, topic: &Topic) -> bool {
        self.channels.lock().await.contains_key(topic)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }

    pub async fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.channels.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn teardown(&self, handle: &ChannelHandle) {
        if handle.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let result =
            tokio::time::timeout(self.teardown_timeout, self.backend.remove_channel(handle.id()))
                .await;
        match result {
            Ok(Ok(())) => {
                tracing::debug!(topic = %handle.topic(), channel = %handle.id(), "channel torn down")
            }
            // the backend drops dead channels on its own; local bookkeeping still goes ahead
            Ok(Err(error)) => {
                tracing::warn!(topic = %handle.topic(), channel = %handle.id(), error = %error, "remote teardown failed")
            }
            Err(_) => {
                tracing::warn!(topic = %handle.topic(), channel = %handle.id(), "remote teardown timed out")
            }
        }
        if let Some(ref m) = self.metrics {
            m.record_channel_closed(handle.topic().as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_memory::MemoryBackend;

    async fn open(backend: &MemoryBackend, topic: &str) -> ChannelHandle {
        let channel = backend.subscribe_changes("listings", None).await.unwrap();
        ChannelHandle::new(channel.id, Topic::new(topic))
    }

    fn registry(backend: &MemoryBackend) -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(backend.clone()), Duration::from_secs(1), None)
    }

    #[tokio::test]
    async fn test_register_replaces_and_tears_down() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend);

        let first = open(&backend, "listings").await;
        registry.register(first.clone()).await;
        let second = open(&backend, "listings").await;
        registry.register(second.clone()).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(&Topic::listings()).await.unwrap().id(), second.id());
        assert!(first.is_torn_down());
        assert!(!second.is_torn_down());
        assert_eq!(backend.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend);
        let handle = open(&backend, "listings").await;
        registry.register(handle.clone()).await;

        registry.remove(&handle).await;
        registry.remove(&handle).await;

        assert!(registry.is_empty().await);
        assert!(handle.is_torn_down());
        assert_eq!(backend.calls_matching("remove_channel"), 1);
    }

    #[tokio::test]
    async fn test_remove_stale_handle_keeps_current() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend);
        let old = open(&backend, "listings").await;
        registry.register(old.clone()).await;
        let current = open(&backend, "listings").await;
        registry.register(current.clone()).await;

        registry.remove(&old).await;
        assert!(registry.contains(&Topic::listings()).await);
    }

    #[tokio::test]
    async fn test_cleanup_all_twice() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend);
        registry.register(open(&backend, "listings").await).await;
        registry.register(open(&backend, "notifications:u1").await).await;

        assert_eq!(
            registry.topics().await,
            vec![Topic::listings(), Topic::notifications("u1")]
        );
        assert_eq!(registry.cleanup_all().await, 2);
        assert_eq!(registry.cleanup_all().await, 0);
        assert_eq!(backend.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_teardown_survives_backend_failure() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend);
        let handle = open(&backend, "listings").await;
        registry.register(handle.clone()).await;

        backend.set_network(false);
        assert!(registry.remove_topic(&Topic::listings()).await.is_some());
        assert!(registry.is_empty().await);
        assert!(handle.is_torn_down());
    }
}
