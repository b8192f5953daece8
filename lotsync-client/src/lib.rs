//! Realtime connection and session resilience for the lotsync marketplace
//!
//! This crate keeps a dealer's view of the marketplace live across flaky
//! networks, sleeping tabs and expiring tokens. It sits between the hosted
//! backend (any [`lotsync_core::Backend`]) and the screens that render
//! listings, notifications and chat.
//!
//! # Core Features
//!
//! - **Resilient Calls**: bounded retry with exponential backoff and jitter,
//!   plus per-call timeouts, for every remote operation
//! - **Connectivity Monitoring**: platform signals and periodic liveness
//!   probes, with a single-flight recovery sequence
//! - **Channel Registry**: at most one open realtime channel per topic, with
//!   idempotent teardown
//! - **Session Keeping**: throttled re-validation, authoritative auth pushes
//!   and an inactivity watchdog
//! - **Subscription Reconciling**: live feeds that are fully reloaded and
//!   reattached after any disruption
//! - **Optimistic Stores**: local-first entity stores corrected by server data
//! - **Observability**: OpenTelemetry metrics and `tracing` spans
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lotsync_client::{ClientBuilder, PlatformEvent};
//! use lotsync_memory::MemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new(MemoryBackend::new()).build()?;
//!     client.initialize().await;
//!     client.start_connectivity_monitoring();
//!
//!     client.listings().reload_all().await?;
//!     let _live = client.listings().subscribe().await;
//!
//!     client.handle_platform_event(PlatformEvent::Visible).await;
//!     client.stop_connectivity_monitoring().await;
//!     Ok(())
//! }
//! ```

mod admin;
mod chat;
mod chat_notifications;
mod client;
mod client_builder;
mod config;
mod connectivity;
mod context;
mod listings;
mod metrics;
mod notice;
mod notifications;
mod reconciler;
mod registry;
mod remote;
mod retry;
mod session;
mod store;

pub use admin::{AdminFeed, ACTIVE_USERS, PENDING_INVITES, PENDING_USERS, USERS};
pub use chat::ChatFeed;
pub use chat_notifications::ChatNotificationsFeed;
pub use client::{Client, PlatformEvent};
pub use client_builder::ClientBuilder;
pub use config::ResilienceConfig;
pub use connectivity::{ConnectivityMonitor, Listener, ListenerGuard, Recovery, RecoverySteps};
pub use context::Context;
pub use listings::{listing_query, ListingsFeed, AVAILABLE, MINE, SEARCHING};
pub use metrics::ClientMetrics;
pub use notice::{Notice, NoticeAction, NoticeLevel, Notices};
pub use notifications::NotificationsFeed;
pub use reconciler::{
    change_handler, reload_handler, ChangeFn, FeedChange, FeedSpec, FeedState, FeedSubscription,
    ReloadFn, SubscriptionReconciler,
};
pub use registry::{ChannelHandle, ChannelRegistry};
pub use remote::Remote;
pub use retry::{retry_notifying, retry_while_online, retry_with_backoff, with_timeout, RetryPolicy};
pub use session::{SessionKeeper, SessionSnapshot, SessionState, SessionView, WatchdogAction};
pub use store::{store_handler, EntityStore, EntityStoreBuilder, Placement, Route};
