//! # lotsync-core
//!
//! Shared building blocks for the lotsync marketplace client.
//!
//! - **error**: the [`Error`] type, its [`ErrorClass`] taxonomy and user-facing messages
//! - **types**: sessions, auth events, realtime change events, queries and mutations
//! - **model**: listing, notification, chat and admin records plus the [`Record`] trait
//! - **backend**: the [`Backend`] trait every remote call goes through
//! - **observability**: OpenTelemetry and `tracing` bootstrap
//!
//! Most applications depend on `lotsync-client` and only name these types
//! through its re-exports.

pub mod backend;
pub mod error;
pub mod model;
pub mod observability;
pub mod types;

pub use backend::{Backend, RemoteChannel};
pub use error::{Error, ErrorClass, RemoteError, Result};
pub use model::{
    from_row, AppUser, ChatChannel, ChatMessage, ChatNotification, DealerSummary, Invitation,
    Listing, ListingForm, ListingPatch, ListingStatus, ModelCode, Notification, Record,
};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{
    row_id, AuthChange, AuthEvent, AuthSession, ChangeEvent, ChangeFilter, ChangeKind, ChannelId,
    Filter, FilterOp, Join, Mutation, Order, Profile, Query, Topic, User,
};
