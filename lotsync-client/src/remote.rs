//! Shared entry point for remote calls
//!
//! [`Remote`] bundles the backend with the current online flag so that each
//! component can run a backend call under a retry policy and a time budget
//! in one line, with uniform logging and metrics.

use crate::metrics::ClientMetrics;
use crate::retry::{retry_notifying, with_timeout, RetryPolicy};
use lotsync_core::{Backend, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Remote {
    backend: Arc<dyn Backend>,
    online: watch::Receiver<bool>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl Remote {
    pub fn new(
        backend: Arc<dyn Backend>,
        online: watch::Receiver<bool>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            backend,
            online,
            metrics,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Run `operation` with retries, each attempt bounded by `timeout`
    ///
    /// Every retry after the first attempt is counted under `label`.
    pub async fn call<T, F, Fut>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        timeout: Duration,
        operation: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let online = self.online.clone();
        let metrics = self.metrics.clone();
        let result = retry_notifying(
            policy,
            move || *online.borrow(),
            |_, _| {
                if let Some(ref m) = metrics {
                    m.record_retry(label);
                }
            },
            || with_timeout(operation(self.backend.clone()), timeout, label),
        )
        .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => {
                tracing::debug!(label, error = %e, "remote call failed");
                match e.class() {
                    lotsync_core::ErrorClass::Timeout => "timeout",
                    _ => "error",
                }
            }
        };
        if let Some(ref m) = self.metrics {
            m.record_remote_call(label, outcome, started.elapsed().as_secs_f64());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::{Query, RemoteError};
    use lotsync_memory::MemoryBackend;

    fn remote(backend: &MemoryBackend) -> Remote {
        let (_tx, online) = watch::channel(true);
        let meter = opentelemetry::global::meter("lotsync-remote-test");
        let metrics = Arc::new(ClientMetrics::new_with_meter(&meter));
        Remote::new(Arc::new(backend.clone()), online, Some(metrics))
    }

    async fn load(remote: &Remote, policy: &RetryPolicy) -> Result<Vec<serde_json::Value>> {
        remote
            .call("load listings", policy, Duration::from_secs(1), |b| async move {
                b.query(&Query::table("listings")).await
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_uses_whole_budget() {
        let backend = MemoryBackend::new();
        backend.fail_table("listings", RemoteError::server_error("upstream down"));
        let remote = remote(&backend);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));

        assert!(load(&remote, &policy).await.is_err());
        assert_eq!(backend.calls_matching("query:listings"), 3);
    }

    #[tokio::test]
    async fn test_success_needs_one_call() {
        let backend = MemoryBackend::new();
        backend.insert_row("listings", serde_json::json!({"id": "l1"}));
        let remote = remote(&backend);

        let rows = load(&remote, &RetryPolicy::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(backend.calls_matching("query:listings"), 1);
    }
}
