//! Timing and retry configuration for the resilience layer

use crate::retry::RetryPolicy;
use lotsync_core::{Error, Result};
use std::time::Duration;

/// Every timer, time budget and retry policy the client uses
///
/// Defaults match production behaviour. Tests usually shrink them with the
/// `with_*` methods; deployments can override a few through `LOTSYNC_*`
/// environment variables via [`ResilienceConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// How often the connectivity probe runs, regardless of believed state
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Budget for the initial session fetch
    pub session_timeout: Duration,
    /// Budget for session refresh and user lookups
    pub auth_timeout: Duration,
    pub profile_timeout: Duration,
    /// Budget for feed loads and CRUD calls
    pub query_timeout: Duration,
    /// Minimum spacing between two session refetches
    pub refetch_throttle: Duration,
    /// Period of the inactivity watchdog
    pub inactivity_timeout: Duration,
    /// Input within this window before the watchdog fires counts as active use
    pub activity_window: Duration,
    pub chat_page_size: usize,
    pub session_retry: RetryPolicy,
    pub profile_retry: RetryPolicy,
    pub refetch_retry: RetryPolicy,
    pub reconnect_retry: RetryPolicy,
    pub query_retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(120),
            auth_timeout: Duration::from_secs(90),
            profile_timeout: Duration::from_secs(120),
            query_timeout: Duration::from_secs(60),
            refetch_throttle: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(25 * 60),
            activity_window: Duration::from_secs(60),
            chat_page_size: 20,
            session_retry: RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(30)),
            profile_retry: RetryPolicy::new(3, Duration::from_secs(3), Duration::from_secs(30)),
            refetch_retry: RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30)),
            reconnect_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30)),
            query_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

impl ResilienceConfig {
    /// Defaults overridden by any `LOTSYNC_*` variables that are set
    ///
    /// Recognised: `LOTSYNC_PROBE_INTERVAL_SECS`, `LOTSYNC_PROBE_TIMEOUT_SECS`,
    /// `LOTSYNC_QUERY_TIMEOUT_SECS`, `LOTSYNC_REFETCH_THROTTLE_SECS`,
    /// `LOTSYNC_INACTIVITY_TIMEOUT_SECS`, `LOTSYNC_CHAT_PAGE_SIZE`.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| Error::Validation(format!("{} must be whole seconds, got {:?}", key, raw)))
                })
                .transpose()
        };

        if let Some(d) = secs("LOTSYNC_PROBE_INTERVAL_SECS")? {
            self.probe_interval = d;
        }
        if let Some(d) = secs("LOTSYNC_PROBE_TIMEOUT_SECS")? {
            self.probe_timeout = d;
        }
        if let Some(d) = secs("LOTSYNC_QUERY_TIMEOUT_SECS")? {
            self.query_timeout = d;
        }
        if let Some(d) = secs("LOTSYNC_REFETCH_THROTTLE_SECS")? {
            self.refetch_throttle = d;
        }
        if let Some(d) = secs("LOTSYNC_INACTIVITY_TIMEOUT_SECS")? {
            self.inactivity_timeout = d;
        }
        if let Some(raw) = lookup("LOTSYNC_CHAT_PAGE_SIZE") {
            self.chat_page_size = raw
                .trim()
                .parse()
                .map_err(|_| Error::Validation(format!("LOTSYNC_CHAT_PAGE_SIZE must be a number, got {:?}", raw)))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the background loops cannot run with
    ///
    /// Periods and time budgets must be non-zero and a chat page must hold
    /// at least one message. A zero refetch throttle is allowed and disables
    /// throttling.
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("probe interval", self.probe_interval),
            ("probe timeout", self.probe_timeout),
            ("session timeout", self.session_timeout),
            ("auth timeout", self.auth_timeout),
            ("profile timeout", self.profile_timeout),
            ("query timeout", self.query_timeout),
            ("inactivity timeout", self.inactivity_timeout),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Validation(format!("{} must be greater than zero", name)));
        }
        if self.chat_page_size == 0 {
            return Err(Error::Validation("chat page size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Ignored when `interval` is zero
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        if non_zero("probe interval", interval) {
            self.probe_interval = interval;
        }
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        if non_zero("probe timeout", timeout) {
            self.probe_timeout = timeout;
        }
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        if non_zero("query timeout", timeout) {
            self.query_timeout = timeout;
        }
        self
    }

    pub fn with_refetch_throttle(mut self, throttle: Duration) -> Self {
        self.refetch_throttle = throttle;
        self
    }

    /// The period is ignored when zero; the window is always taken
    pub fn with_inactivity_timeout(mut self, timeout: Duration, activity_window: Duration) -> Self {
        if non_zero("inactivity timeout", timeout) {
            self.inactivity_timeout = timeout;
        }
        self.activity_window = activity_window;
        self
    }

    pub fn with_chat_page_size(mut self, size: usize) -> Self {
        if size == 0 {
            tracing::warn!("ignoring zero chat page size");
        } else {
            self.chat_page_size = size;
        }
        self
    }

    /// Use one policy for every remote call
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.session_retry = policy.clone();
        self.profile_retry = policy.clone();
        self.refetch_retry = policy.clone();
        self.reconnect_retry = policy.clone();
        self.query_retry = policy;
        self
    }
}

fn non_zero(name: &str, duration: Duration) -> bool {
    if duration.is_zero() {
        tracing::warn!(setting = name, "ignoring zero duration");
        return false;
    }
    true
}
