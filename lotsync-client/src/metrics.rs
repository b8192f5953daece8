//! OpenTelemetry metrics for the resilience layer
//!
//! Instruments cover connectivity (online gauge, probes, reconnects), the
//! session keeper, retries, realtime channels and optimistic rollbacks.
//! Names are prefixed `lotsync.client.`.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

pub struct ClientMetrics {
    pub online: Gauge<i64>,
    pub probes_total: Counter<u64>,
    pub reconnect_attempts: Counter<u64>,
    pub reconnect_success: Counter<u64>,
    pub session_refreshes: Counter<u64>,
    pub remote_calls_total: Counter<u64>,
    pub remote_call_duration: Histogram<f64>,
    pub retries: Counter<u64>,
    pub channels_opened: Counter<u64>,
    pub channels_closed: Counter<u64>,
    pub changes_received: Counter<u64>,
    pub rollbacks_total: Counter<u64>,
}

impl ClientMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        // global::meter wants a 'static name; one leak per client is fine
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            online: meter
                .i64_gauge("lotsync.client.online")
                .with_description("Believed connectivity (1=online, 0=offline)")
                .build(),
            probes_total: meter
                .u64_counter("lotsync.client.probes.total")
                .with_description("Liveness probes by outcome")
                .build(),
            reconnect_attempts: meter
                .u64_counter("lotsync.client.reconnect.attempts")
                .with_description("Recovery sequences started")
                .build(),
            reconnect_success: meter
                .u64_counter("lotsync.client.reconnect.success")
                .with_description("Recovery sequences that restored the session and feeds")
                .build(),
            session_refreshes: meter
                .u64_counter("lotsync.client.session.refreshes")
                .with_description("Session fetches and refreshes by outcome")
                .build(),
            remote_calls_total: meter
                .u64_counter("lotsync.client.remote.calls")
                .with_description("Remote operations by label and outcome")
                .build(),
            remote_call_duration: meter
                .f64_histogram("lotsync.client.remote.duration")
                .with_description("Remote operation duration in seconds, retries included")
                .build(),
            retries: meter
                .u64_counter("lotsync.client.retries")
                .with_description("Retry attempts after a failed first try, by operation")
                .build(),
            channels_opened: meter
                .u64_counter("lotsync.client.channels.opened")
                .with_description("Realtime channels opened")
                .build(),
            channels_closed: meter
                .u64_counter("lotsync.client.channels.closed")
                .with_description("Realtime channels torn down")
                .build(),
            changes_received: meter
                .u64_counter("lotsync.client.changes.received")
                .with_description("Realtime change events received")
                .build(),
            rollbacks_total: meter
                .u64_counter("lotsync.client.optimistic.rollbacks")
                .with_description("Optimistic mutations discarded by a reload")
                .build(),
        }
    }

    pub fn update_online(&self, online: bool) {
        self.online.record(online as i64, &[]);
    }

    pub fn record_probe(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.probes_total.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.add(1, &[]);
    }

    pub fn record_reconnect_success(&self) {
        self.reconnect_success.add(1, &[]);
    }

    pub fn record_session_refresh(&self, kind: &str, outcome: &str) {
        let attributes = &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.session_refreshes.add(1, attributes);
    }

    pub fn record_remote_call(&self, label: &str, outcome: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("label", label.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.remote_calls_total.add(1, attributes);
        self.remote_call_duration.record(duration_secs, attributes);
    }

    pub fn record_retry(&self, label: &str) {
        self.retries
            .add(1, &[KeyValue::new("operation", label.to_string())]);
    }

    pub fn record_channel_opened(&self, topic: &str) {
        self.channels_opened
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_channel_closed(&self, topic: &str) {
        self.channels_closed
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_change(&self, topic: &str, kind: &str) {
        let attributes = &[
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("kind", kind.to_string()),
        ];
        self.changes_received.add(1, attributes);
    }

    pub fn record_rollback(&self, entity: &str) {
        self.rollbacks_total
            .add(1, &[KeyValue::new("entity", entity.to_string())]);
    }
}
