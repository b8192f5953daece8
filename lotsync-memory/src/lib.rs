//! # lotsync-memory
//!
//! An in-process stand-in for the hosted marketplace backend.
//!
//! [`MemoryBackend`] implements [`lotsync_core::Backend`] over a table store
//! ([`MemoryDb`]) and a change-feed hub. It also simulates the parts of a
//! real network the client has to survive:
//!
//! - the network going away (calls fail, open channels are dropped)
//! - per-call latency
//! - injected server errors, by call name prefix
//! - auth pushes (sign in, sign out, token refresh)
//!
//! Every call is recorded in an ordered log so tests can assert on the exact
//! sequence the client produced.

mod backend;
mod channels;
mod db;
mod procedures;

pub use backend::{MemoryBackend, Procedure};
pub use db::{timestamp, MemoryDb};
