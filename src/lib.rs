//! lotsync - realtime marketplace sync for dealer clients
//!
//! This is the main convenience crate that re-exports all lotsync sub-crates.
//! Use this crate if you want a single dependency that provides the client
//! together with the in-process backend used by demos and tests.
//!
//! # Architecture
//!
//! lotsync is organized into modular crates:
//!
//! - **lotsync-core**: error taxonomy, wire types, records, the `Backend` trait, observability
//! - **lotsync-client**: retry, connectivity, channel registry, session keeping, live feeds
//! - **lotsync-memory**: in-process backend with a simulated network
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lotsync::{ClientBuilder, MemoryBackend, PlatformEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     let client = ClientBuilder::new(backend.clone()).build()?;
//!     client.initialize().await;
//!     client.start_connectivity_monitoring();
//!
//!     let _notifications = client.notifications().subscribe().await;
//!
//!     // the platform reports the network coming back
//!     client.handle_platform_event(PlatformEvent::Online).await;
//!
//!     client.stop_connectivity_monitoring().await;
//!     Ok(())
//! }
//! ```

// Re-export all public APIs from sub-crates
pub use lotsync_client as client;
pub use lotsync_core as core;
pub use lotsync_memory as memory;

// Convenience re-exports of the most commonly used types
pub use lotsync_client::{Client, ClientBuilder, PlatformEvent, ResilienceConfig};
pub use lotsync_core::{Backend, Error, Result};
pub use lotsync_memory::MemoryBackend;
