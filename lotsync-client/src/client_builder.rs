//! Client builder for wiring the component graph
//!
//! The `ClientBuilder` provides a fluent API for configuring the client
//! before it is built. It allows you to:
//! - Tune timing and retry behaviour through [`ResilienceConfig`]
//! - Set the initial connectivity flag reported by the platform
//! - Configure observability (OpenTelemetry) and client metrics
//!
//! # Examples
//!
//! ```rust,no_run
//! use lotsync_client::{ClientBuilder, ResilienceConfig};
//! use lotsync_memory::MemoryBackend;
//! use std::time::Duration;
//!
//! # fn example() -> lotsync_core::Result<()> {
//! let client = ClientBuilder::new(MemoryBackend::new())
//!     .with_config(ResilienceConfig::default().with_probe_interval(Duration::from_secs(15)))
//!     .with_default_observability()
//!     .service_name("dealer-portal")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::config::ResilienceConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::context::Context;
use crate::metrics::ClientMetrics;
use crate::notice::Notices;
use crate::reconciler::SubscriptionReconciler;
use crate::registry::ChannelRegistry;
use crate::remote::Remote;
use crate::session::SessionKeeper;
use lotsync_core::{Backend, Error, ObservabilityConfig, Result};
use std::sync::Arc;

/// Builder for configuring and creating a [`Client`]
pub struct ClientBuilder {
    backend: Arc<dyn Backend>,
    config: ResilienceConfig,
    initially_online: bool,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
    enable_metrics: bool,
}

impl ClientBuilder {
    pub fn new(backend: impl Backend) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Build on a backend that is already shared
    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            config: ResilienceConfig::default(),
            initially_online: true,
            observability_config: None,
            service_name: None,
            enable_metrics: false,
        }
    }

    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Connectivity reported by the platform at start (default online)
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self.enable_metrics = true;
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(self) -> Self {
        self.with_observability(ObservabilityConfig::default())
    }

    /// Record client metrics against the global meter provider
    pub fn with_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    /// Service name for telemetry
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let mut service_name = self
            .service_name
            .clone()
            .unwrap_or_else(|| "lotsync".to_string());

        if let Some(mut config) = self.observability_config {
            if let Some(name) = self.service_name {
                config.service_name = name;
            }
            service_name = config.service_name.clone();
            lotsync_core::init_observability(config).map_err(|e| {
                Error::Internal(format!("Failed to initialize observability: {}", e))
            })?;
        }
        let metrics = self
            .enable_metrics
            .then(|| Arc::new(ClientMetrics::new(service_name)));

        let config = self.config;
        let backend = self.backend;
        let connectivity = Arc::new(ConnectivityMonitor::new(
            backend.clone(),
            self.initially_online,
            config.probe_timeout,
            metrics.clone(),
        ));
        let remote = Remote::new(backend.clone(), connectivity.watch(), metrics.clone());
        let registry = Arc::new(ChannelRegistry::new(
            backend,
            config.probe_timeout,
            metrics.clone(),
        ));
        let notices = Notices::new();
        let session = Arc::new(SessionKeeper::new(
            remote.clone(),
            config.clone(),
            notices.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(SubscriptionReconciler::new(
            remote.clone(),
            registry.clone(),
            config.clone(),
            metrics.clone(),
        ));

        tracing::debug!(online = self.initially_online, "client built");
        Ok(Client::from_context(Context {
            config,
            remote,
            connectivity,
            registry,
            session,
            reconciler,
            notices,
            metrics,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_memory::MemoryBackend;
    use std::time::Duration;

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::new(MemoryBackend::new());
        assert!(builder.initially_online);
        assert!(!builder.enable_metrics);
        assert!(builder.observability_config.is_none());
        assert_eq!(builder.config.probe_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_observability_config() {
        let config = ObservabilityConfig::new("test-client")
            .with_endpoint("http://localhost:4317")
            .with_log_level("debug");

        let builder = ClientBuilder::new(MemoryBackend::new()).with_observability(config);

        assert!(builder.enable_metrics);
        let obs_config = builder.observability_config.unwrap();
        assert_eq!(obs_config.service_name, "test-client");
        assert_eq!(obs_config.log_level, "debug");
    }

    #[tokio::test]
    async fn test_build_starts_offline_when_told() {
        let client = ClientBuilder::new(MemoryBackend::new())
            .initially_online(false)
            .with_config(ResilienceConfig::default().with_chat_page_size(5))
            .build()
            .unwrap();
        assert!(!client.is_online());
        assert_eq!(client.config().chat_page_size, 5);
        assert!(client.registry().is_empty().await);
    }

    #[test]
    fn test_build_rejects_zero_probe_interval() {
        let mut config = ResilienceConfig::default();
        config.probe_interval = Duration::ZERO;
        let result = ClientBuilder::new(MemoryBackend::new())
            .with_config(config)
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_build_with_metrics() {
        let client = ClientBuilder::new(MemoryBackend::new())
            .with_metrics()
            .service_name("builder-test")
            .build()
            .unwrap();
        assert!(client.context().metrics.is_some());
    }
}
