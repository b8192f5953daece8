//! Common test utilities for lotsync-client integration tests
//!
//! Builds clients over the in-process backend with timers shrunk so that
//! retries and probes finish in milliseconds.

#![allow(dead_code)]

use lotsync_client::{Client, ClientBuilder, ResilienceConfig, RetryPolicy};
use lotsync_core::User;
use lotsync_memory::MemoryBackend;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

pub const DEALER: &str = "d1";
pub const OTHER_DEALER: &str = "d2";

/// Short timers, two attempts per call, no jitter
pub fn fast_config() -> ResilienceConfig {
    ResilienceConfig::default()
        .with_retry_policy(
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50)).without_jitter(),
        )
        .with_probe_interval(Duration::from_millis(50))
        .with_probe_timeout(Duration::from_millis(500))
        .with_query_timeout(Duration::from_secs(1))
}

/// Backend with two dealer profiles and nothing else
pub fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.insert_row(
        "profiles",
        json!({"id": DEALER, "dealer_name": "Northside Motors", "email": "sales@northside.test"}),
    );
    backend.insert_row(
        "profiles",
        json!({"id": OTHER_DEALER, "dealer_name": "Harbor Auto"}),
    );
    backend
}

pub fn listing_row(id: &str, dealer_id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "dealer_id": dealer_id,
        "make": "Toyota",
        "model": "Camry",
        "year": 2022,
        "status": status,
        "created_at": "2026-01-01T00:00:00Z",
    })
}

pub fn notification_row(id: &str, user_id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "user_id": user_id,
        "title": title,
        "read": false,
        "created_at": "2026-01-01T00:00:00Z",
    })
}

/// Client over `backend`, built with [`fast_config`] and not yet initialized
pub fn client_for(backend: &MemoryBackend) -> Client {
    ClientBuilder::new(backend.clone())
        .with_config(fast_config())
        .build()
        .unwrap()
}

/// Sign [`DEALER`] in on the backend and start a client on that session
pub async fn signed_in_client(backend: &MemoryBackend) -> Client {
    backend.sign_in(User::new(DEALER).with_email("sales@northside.test"));
    let client = client_for(backend);
    let view = client.initialize().await;
    assert!(view.user.is_some(), "dealer should be signed in after initialize");
    client
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
