//! [`MemoryBackend`]: the hosted backend, in process
//!
//! Every trait call is appended to an ordered call log (`get_session`,
//! `query:<table>`, `subscribe:<table>`, `remove_channel:<id>`, ...), then
//! waits out the configured latency, then fails if the simulated network is
//! down or a fault is registered for the call. Test helpers such as
//! [`MemoryBackend::insert_row`] bypass all of that but still fan changes out
//! to open channels.

use crate::channels::ChannelHub;
use crate::db::MemoryDb;
use crate::procedures;
use async_trait::async_trait;
use lotsync_core::{
    AuthChange, AuthEvent, AuthSession, Backend, ChangeFilter, ChannelId, Error, Mutation, Query,
    RemoteChannel, RemoteError, Result, User,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// A server-side procedure: database, parameters, caller
pub type Procedure =
    Arc<dyn Fn(&mut MemoryDb, Value, Option<&User>) -> Result<Value> + Send + Sync>;

struct State {
    db: MemoryDb,
    hub: ChannelHub,
    session: Option<AuthSession>,
    issued_tokens: u64,
    network_up: bool,
    latency: Duration,
    faults: Vec<(String, RemoteError)>,
    calls: Vec<String>,
    procedures: HashMap<String, Procedure>,
}

impl State {
    /// Deliver whatever the last write recorded
    fn flush(&mut self) {
        for event in self.db.take_events() {
            self.hub.publish(&event);
        }
    }

    fn issue_session(&mut self, user: User) -> AuthSession {
        self.issued_tokens += 1;
        AuthSession {
            access_token: format!("token-{}", self.issued_tokens),
            expires_at: None,
            user,
        }
    }
}

struct Inner {
    state: Mutex<State>,
    auth: broadcast::Sender<AuthChange>,
}

/// In-process backend with a simulated network
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty backend, network up, marketplace procedures registered
    pub fn new() -> Self {
        let (auth, _) = broadcast::channel(64);
        let backend = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    db: MemoryDb::new(),
                    hub: ChannelHub::default(),
                    session: None,
                    issued_tokens: 0,
                    network_up: true,
                    latency: Duration::ZERO,
                    faults: Vec::new(),
                    calls: Vec::new(),
                    procedures: HashMap::new(),
                }),
                auth,
            }),
        };
        procedures::install(&backend);
        backend
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log, delay, then apply network and fault rules for one call
    async fn enter(&self, call: String) -> Result<()> {
        let latency = {
            let mut state = self.state();
            state.calls.push(call.clone());
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.state();
        if !state.network_up {
            return Err(Error::Network("Failed to fetch".to_string()));
        }
        if let Some((_, fault)) = state.faults.iter().find(|(prefix, _)| call.starts_with(prefix.as_str())) {
            tracing::debug!(call = %call, "injected fault");
            return Err(Error::Remote(fault.clone()));
        }
        Ok(())
    }

    pub fn register_procedure<F>(&self, name: impl Into<String>, procedure: F)
    where
        F: Fn(&mut MemoryDb, Value, Option<&User>) -> Result<Value> + Send + Sync + 'static,
    {
        self.state()
            .procedures
            .insert(name.into(), Arc::new(procedure));
    }

    // --- auth controls ---

    /// Start a session for `user` and push `SignedIn`
    pub fn sign_in(&self, user: User) -> AuthSession {
        let session = {
            let mut state = self.state();
            let session = state.issue_session(user);
            state.session = Some(session.clone());
            session
        };
        self.broadcast(AuthChange::new(AuthEvent::SignedIn, Some(session.clone())));
        session
    }

    /// End the session and push `SignedOut`
    pub fn sign_out(&self) {
        self.state().session = None;
        self.broadcast(AuthChange::new(AuthEvent::SignedOut, None));
    }

    /// End the session without telling anyone, as when a token expires server-side
    pub fn sign_out_silently(&self) {
        self.state().session = None;
    }

    /// Push `event` with the current session attached
    pub fn push_auth(&self, event: AuthEvent) {
        let session = self.state().session.clone();
        self.broadcast(AuthChange::new(event, session));
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.state().session.clone()
    }

    fn broadcast(&self, change: AuthChange) {
        // no receivers is fine
        let _ = self.inner.auth.send(change);
    }

    // --- network and fault controls ---

    /// Take the network down or bring it back; going down drops every channel
    pub fn set_network(&self, up: bool) {
        let mut state = self.state();
        state.network_up = up;
        if !up {
            let dropped = state.hub.close_all();
            tracing::debug!(dropped, "network down");
        }
    }

    pub fn is_network_up(&self) -> bool {
        self.state().network_up
    }

    /// Delay applied to every call before it runs
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Fail every call whose log entry starts with `prefix`
    pub fn fail_calls(&self, prefix: impl Into<String>, error: RemoteError) {
        self.state().faults.push((prefix.into(), error));
    }

    /// Fail reads and writes against `table`
    pub fn fail_table(&self, table: &str, error: RemoteError) {
        let mut state = self.state();
        state.faults.push((format!("query:{}", table), error.clone()));
        state.faults.push((format!("mutate:{}", table), error));
    }

    pub fn clear_failures(&self) {
        self.state().faults.clear();
    }

    // --- data helpers (no network, no call log) ---

    pub fn insert_row(&self, table: &str, row: Value) -> Value {
        let mut state = self.state();
        let result = state.db.insert(table, row);
        state.flush();
        match result {
            Ok(row) => row,
            Err(error) => {
                tracing::warn!(table, error = %error, "seed row rejected");
                Value::Null
            }
        }
    }

    pub fn update_row(&self, table: &str, id: &str, patch: Value) -> Option<Value> {
        let mut state = self.state();
        let result = state.db.update(table, id, &patch).ok();
        state.flush();
        result
    }

    pub fn delete_row(&self, table: &str, id: &str) -> Option<Value> {
        let mut state = self.state();
        let removed = state.db.delete(table, id);
        state.flush();
        removed
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state().db.rows(table).to_vec()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.state().db.find(table, id).cloned()
    }

    // --- inspection ---

    pub fn open_channels(&self) -> usize {
        self.state().hub.len()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Put a marker in the call log, for ordering assertions
    pub fn log_marker(&self, name: &str) {
        self.state().calls.push(format!("marker:{}", name));
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_session(&self) -> Result<Option<AuthSession>> {
        self.enter("get_session".to_string()).await?;
        Ok(self.state().session.clone())
    }

    async fn refresh_session(&self) -> Result<AuthSession> {
        self.enter("refresh_session".to_string()).await?;
        let mut state = self.state();
        let Some(current) = state.session.take() else {
            return Err(Error::Session("Auth session missing!".to_string()));
        };
        let session = state.issue_session(current.user);
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn get_user(&self) -> Result<Option<User>> {
        self.enter("get_user".to_string()).await?;
        Ok(self.state().session.as_ref().map(|s| s.user.clone()))
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.inner.auth.subscribe()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Value>> {
        self.enter(format!("query:{}", query.table)).await?;
        Ok(self.state().db.select(query))
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value> {
        self.enter(format!("mutate:{}", mutation.table())).await?;
        let mut state = self.state();
        let result = state.db.apply(mutation);
        state.flush();
        result
    }

    async fn rpc(&self, name: &str, params: Value) -> Result<Value> {
        self.enter(format!("rpc:{}", name)).await?;
        let mut state = self.state();
        let Some(procedure) = state.procedures.get(name).cloned() else {
            return Err(RemoteError::not_found(format!(
                "Could not find the function public.{}",
                name
            ))
            .with_code("PGRST202")
            .into());
        };
        let caller = state.session.as_ref().map(|s| s.user.clone());
        let result = procedure(&mut state.db, params, caller.as_ref());
        state.flush();
        result
    }

    async fn subscribe_changes(
        &self,
        table: &str,
        filter: Option<&ChangeFilter>,
    ) -> Result<RemoteChannel> {
        self.enter(format!("subscribe:{}", table)).await?;
        Ok(self.state().hub.open(table, filter))
    }

    async fn remove_channel(&self, id: ChannelId) -> Result<()> {
        self.enter(format!("remove_channel:{}", id)).await?;
        self.state().hub.close(id);
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        self.enter("probe".to_string()).await
    }
}
