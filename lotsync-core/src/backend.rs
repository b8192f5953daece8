//! Contract of the hosted backend consumed by the client
//!
//! The backend is an opaque remote service: auth, generic reads and writes,
//! named procedures and a change-subscription primitive keyed by table. The
//! client never assumes more than what this trait exposes, so any transport
//! (a hosted service SDK, an in-process fake) can sit behind it.

use crate::error::Result;
use crate::types::{AuthChange, AuthSession, ChangeEvent, ChangeFilter, ChannelId, Mutation, Query, User};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// An open realtime channel
///
/// Events arrive in the order the backend emits them. The receiver closes
/// when the backend drops the channel.
#[derive(Debug)]
pub struct RemoteChannel {
    pub id: ChannelId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Current session, `None` when signed out
    async fn get_session(&self) -> Result<Option<AuthSession>>;

    /// Exchange the refresh token for a new session
    async fn refresh_session(&self) -> Result<AuthSession>;

    /// Re-read the user behind the current session
    async fn get_user(&self) -> Result<Option<User>>;

    /// Stream of auth transitions pushed by the backend
    fn auth_changes(&self) -> broadcast::Receiver<AuthChange>;

    async fn query(&self, query: &Query) -> Result<Vec<Value>>;

    /// Apply a write, returning the affected row
    async fn mutate(&self, mutation: &Mutation) -> Result<Value>;

    /// Call a server-side procedure
    async fn rpc(&self, name: &str, params: Value) -> Result<Value>;

    async fn subscribe_changes(
        &self,
        table: &str,
        filter: Option<&ChangeFilter>,
    ) -> Result<RemoteChannel>;

    /// Close a channel; closing an unknown channel is not an error
    async fn remove_channel(&self, id: ChannelId) -> Result<()>;

    /// Cheap uncached liveness check
    async fn probe(&self) -> Result<()>;
}
