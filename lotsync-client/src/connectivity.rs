//! Connectivity tracking and the recovery sequence
//!
//! [`ConnectivityMonitor`] holds the believed online flag and the listeners
//! interested in its transitions. The flag moves for two reasons: platform
//! signals (`Online`, `Offline`, visibility) fed in by the application, and
//! liveness probes against the backend, which run periodically so that a
//! missed platform event is still caught.
//!
//! # Recovery
//!
//! [`ConnectivityMonitor::reconnect`] runs the recovery sequence:
//!
//! ```text
//! refresh session → probe query → tear down and recreate channels
//! ```
//!
//! Any failing step aborts the sequence and reports the error. Nothing is
//! left half-recovered in a way that blocks a retry: the next online or
//! visibility event simply runs the whole sequence again. Only one sequence
//! runs at a time; a request arriving while one is in flight is skipped.

use crate::metrics::ClientMetrics;
use crate::retry::with_timeout;
use async_trait::async_trait;
use lotsync_core::{Backend, Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Callback invoked with the new online value on every transition
///
/// Returning an error unregisters the listener.
pub type Listener = Arc<dyn Fn(bool) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// The three steps of the recovery sequence, supplied by the client
#[async_trait]
pub trait RecoverySteps: Send + Sync {
    async fn refresh_session(&self) -> Result<()>;

    /// Lightweight authenticated read proving the session works end to end
    async fn probe_query(&self) -> Result<()>;

    /// Tear down every registered channel and recreate the wanted feeds
    async fn restore_channels(&self) -> Result<()>;
}

/// Outcome of a [`ConnectivityMonitor::reconnect`] call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Restored,
    /// Another recovery sequence was already running
    AlreadyRunning,
}

pub struct ConnectivityMonitor {
    backend: Arc<dyn Backend>,
    probe_timeout: Duration,
    online: watch::Sender<bool>,
    listeners: Arc<Mutex<Listeners>>,
    recovering: tokio::sync::Mutex<()>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ConnectivityMonitor {
    pub fn new(
        backend: Arc<dyn Backend>,
        initially_online: bool,
        probe_timeout: Duration,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let (online, _) = watch::channel(initially_online);
        if let Some(ref m) = metrics {
            m.update_online(initially_online);
        }
        Self {
            backend,
            probe_timeout,
            online,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            recovering: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Receiver tracking the online flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Register a transition listener; it stays registered while the guard lives
    pub fn subscribe<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(bool) -> Result<()> + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));
        ListenerGuard {
            id,
            listeners: Some(Arc::downgrade(&self.listeners)),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }

    /// Record the online flag; listeners run only if it changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!(online, "connectivity changed");
            if let Some(ref m) = self.metrics {
                m.update_online(online);
            }
            self.notify(online);
        }
        changed
    }

    fn notify(&self, online: bool) {
        // listeners run without the lock so they may (un)subscribe
        let snapshot: Vec<(u64, Listener)> = lock(&self.listeners).entries.clone();

        let failed: Vec<u64> = snapshot
            .into_iter()
            .filter_map(|(id, listener)| match listener(online) {
                Ok(()) => None,
                Err(error) => {
                    tracing::warn!(listener = id, error = %error, "removing failing connectivity listener");
                    Some(id)
                }
            })
            .collect();

        if !failed.is_empty() {
            lock(&self.listeners)
                .entries
                .retain(|(id, _)| !failed.contains(id));
        }
    }

    /// Probe the backend and update the online flag
    ///
    /// Never fails; returns the resulting online value.
    #[tracing::instrument(skip(self))]
    pub async fn check_connection(&self) -> bool {
        let backend = self.backend.clone();
        let result = with_timeout(
            async move { backend.probe().await },
            self.probe_timeout,
            "connectivity probe",
        )
        .await;

        let online = match result {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(error = %error, "connectivity probe failed");
                false
            }
        };
        if let Some(ref m) = self.metrics {
            m.record_probe(online);
        }
        self.set_online(online);
        online
    }

    /// Run the recovery sequence once
    #[tracing::instrument(skip(self, steps))]
    pub async fn reconnect(&self, steps: &dyn RecoverySteps) -> Result<Recovery> {
        if !self.is_online() {
            tracing::debug!("offline, skipping recovery");
            return Err(Error::Offline);
        }

        let Ok(_guard) = self.recovering.try_lock() else {
            tracing::debug!("recovery already in progress");
            return Ok(Recovery::AlreadyRunning);
        };

        if let Some(ref m) = self.metrics {
            m.record_reconnect_attempt();
        }
        tracing::info!("starting recovery sequence");

        steps.refresh_session().await.map_err(|e| {
            tracing::warn!(error = %e, "recovery: session refresh failed");
            e
        })?;
        steps.probe_query().await.map_err(|e| {
            tracing::warn!(error = %e, "recovery: probe query failed");
            e
        })?;
        steps.restore_channels().await.map_err(|e| {
            tracing::warn!(error = %e, "recovery: channel restore failed");
            e
        })?;

        if let Some(ref m) = self.metrics {
            m.record_reconnect_success();
        }
        tracing::info!("recovery sequence complete");
        Ok(Recovery::Restored)
    }
}

/// Keeps a connectivity listener registered until dropped
pub struct ListenerGuard {
    id: u64,
    listeners: Option<Weak<Mutex<Listeners>>>,
}

impl ListenerGuard {
    /// Leave the listener registered for the monitor's lifetime
    pub fn detach(mut self) {
        self.listeners = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.take().and_then(|w| w.upgrade()) {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(listeners: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(backend: &MemoryBackend) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            Arc::new(backend.clone()),
            true,
            Duration::from_millis(200),
            None,
        )
    }

    #[test]
    fn test_notify_only_on_change() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _guard = monitor.subscribe(move |online| {
            sink.lock().unwrap().push(online);
            Ok(())
        });

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn test_failing_listener_is_removed() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        let counter = healthy_calls.clone();

        let _bad = monitor.subscribe(|_| Err(Error::Internal("listener blew up".into())));
        let _good = monitor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(monitor.listener_count(), 2);

        monitor.set_online(false);
        assert_eq!(monitor.listener_count(), 1);
        monitor.set_online(true);

        assert_eq!(healthy_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let guard = monitor.subscribe(|_| Ok(()));
        let kept = monitor.subscribe(|_| Ok(()));
        kept.detach();
        assert_eq!(monitor.listener_count(), 2);
        drop(guard);
        assert_eq!(monitor.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_flips_state() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let mut rx = monitor.watch();

        backend.set_network(false);
        assert!(!monitor.check_connection().await);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());

        backend.set_network(true);
        assert!(monitor.check_connection().await);
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_counts_as_offline() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        backend.set_latency(Duration::from_secs(60));
        assert!(!monitor.check_connection().await);
        assert!(!monitor.is_online());
    }

    struct CountingSteps {
        calls: Mutex<Vec<&'static str>>,
        fail_probe: bool,
    }

    #[async_trait]
    impl RecoverySteps for CountingSteps {
        async fn refresh_session(&self) -> Result<()> {
            self.calls.lock().unwrap().push("refresh");
            Ok(())
        }

        async fn probe_query(&self) -> Result<()> {
            self.calls.lock().unwrap().push("probe");
            if self.fail_probe {
                return Err(Error::Network("probe failed".into()));
            }
            Ok(())
        }

        async fn restore_channels(&self) -> Result<()> {
            self.calls.lock().unwrap().push("restore");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reconnect_runs_steps_in_order() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let steps = CountingSteps {
            calls: Mutex::new(Vec::new()),
            fail_probe: false,
        };

        assert_eq!(monitor.reconnect(&steps).await.unwrap(), Recovery::Restored);
        assert_eq!(*steps.calls.lock().unwrap(), vec!["refresh", "probe", "restore"]);
    }

    #[tokio::test]
    async fn test_reconnect_stops_at_failed_step() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        let steps = CountingSteps {
            calls: Mutex::new(Vec::new()),
            fail_probe: true,
        };

        assert!(monitor.reconnect(&steps).await.is_err());
        assert_eq!(*steps.calls.lock().unwrap(), vec!["refresh", "probe"]);

        // a later attempt runs the whole sequence again
        assert!(monitor.reconnect(&steps).await.is_err());
        assert_eq!(steps.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_reconnect_refused_while_offline() {
        let backend = MemoryBackend::new();
        let monitor = monitor(&backend);
        monitor.set_online(false);
        let steps = CountingSteps {
            calls: Mutex::new(Vec::new()),
            fail_probe: false,
        };

        assert!(matches!(monitor.reconnect(&steps).await, Err(Error::Offline)));
        assert!(steps.calls.lock().unwrap().is_empty());
    }
}
